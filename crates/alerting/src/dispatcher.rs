use anyhow::{Context, Result};
use mintwatch_config::AlertsConfig;
use mintwatch_core_types::Alert;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::formatter::{discord_payload, telegram_payload};

#[derive(Debug, Clone)]
pub enum ChannelKind {
    Discord { webhook_url: String },
    Telegram { bot_token: String, chat_id: String },
}

impl ChannelKind {
    fn name(&self) -> &'static str {
        match self {
            ChannelKind::Discord { .. } => "discord",
            ChannelKind::Telegram { .. } => "telegram",
        }
    }

    fn endpoint(&self) -> String {
        match self {
            ChannelKind::Discord { webhook_url } => webhook_url.clone(),
            ChannelKind::Telegram { bot_token, .. } => {
                format!("https://api.telegram.org/bot{bot_token}/sendMessage")
            }
        }
    }

    fn payload(&self, alert: &Alert) -> Value {
        match self {
            ChannelKind::Discord { .. } => discord_payload(alert),
            ChannelKind::Telegram { chat_id, .. } => telegram_payload(alert, chat_id),
        }
    }
}

/// What to do with a completed send attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SendDecision {
    Delivered,
    /// Transient: retry after the default backoff for this attempt.
    RetryBackoff,
    /// Rate limited: retry no sooner than the server-provided delay.
    RetryAfter(f64),
    /// Non-retryable client error.
    Drop,
}

/// Classifies a response status plus optional `retry_after` seconds (header
/// or body) into a retry decision. Network errors map to `RetryBackoff` at
/// the call site.
pub fn classify_response(status: u16, retry_after_seconds: Option<f64>) -> SendDecision {
    if (200..300).contains(&status) {
        return SendDecision::Delivered;
    }
    if status == 429 {
        return SendDecision::RetryAfter(retry_after_seconds.unwrap_or(5.0).max(0.0));
    }
    if (500..600).contains(&status) {
        return SendDecision::RetryBackoff;
    }
    SendDecision::Drop
}

/// Per-channel token bucket. `try_acquire` consumes one token when
/// available; otherwise callers may wait up to the configured bound and then
/// drop the alert.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_second: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_minute: u32) -> Self {
        let capacity = rate_per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_second: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one token is available; zero when one already is.
    pub fn seconds_until_available(&mut self) -> f64 {
        self.refill();
        if self.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - self.tokens) / self.refill_per_second
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_second).min(self.capacity);
    }
}

pub fn channels_from_config(config: &AlertsConfig) -> Vec<ChannelKind> {
    let mut channels = Vec::new();
    if let Some(webhook_url) = &config.discord_webhook_url {
        channels.push(ChannelKind::Discord {
            webhook_url: webhook_url.clone(),
        });
    }
    if let (Some(bot_token), Some(chat_id)) =
        (&config.telegram_bot_token, &config.telegram_chat_id)
    {
        channels.push(ChannelKind::Telegram {
            bot_token: bot_token.clone(),
            chat_id: chat_id.clone(),
        });
    }
    channels
}

/// Fan-out dispatcher: one worker and one bounded queue per channel; FIFO
/// within a channel. A full queue drops the alert with an error rather than
/// blocking the detector.
pub struct AlertDispatcher {
    senders: Vec<(String, mpsc::Sender<Alert>)>,
    workers: Vec<JoinHandle<()>>,
}

impl AlertDispatcher {
    pub fn start(config: &AlertsConfig) -> Result<Self> {
        let channels = channels_from_config(config);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1_000)))
            .build()
            .context("failed building alert http client")?;

        let mut senders = Vec::new();
        let mut workers = Vec::new();
        for channel in channels {
            let (tx, rx) = mpsc::channel(config.queue_capacity.max(8));
            let worker = ChannelWorker {
                channel: channel.clone(),
                http: http.clone(),
                retry_delays_ms: config.retry_delays_ms.clone(),
                max_attempts: config.max_attempts.max(1),
                bucket: TokenBucket::new(config.rate_per_minute),
                max_wait: Duration::from_millis(config.max_wait_ms),
            };
            senders.push((channel.name().to_string(), tx));
            workers.push(tokio::spawn(worker.run(rx)));
        }

        if senders.is_empty() {
            info!("no alert channels configured, alerts will only reach the append sink");
        }
        Ok(Self { senders, workers })
    }

    pub fn channel_count(&self) -> usize {
        self.senders.len()
    }

    pub fn dispatch(&self, alert: &Alert) {
        for (name, sender) in &self.senders {
            if let Err(err) = sender.try_send(alert.clone()) {
                error!(channel = %name, mint = %alert.mint, error = %err, "alert queue full, dropping alert");
            }
        }
    }

    /// Stops intake and waits for queues to drain. Returns false when the
    /// deadline expired with work still in flight.
    pub async fn shutdown(self, deadline: Duration) -> bool {
        drop(self.senders);
        let drain = async {
            for worker in self.workers {
                let _ = worker.await;
            }
        };
        time::timeout(deadline, drain).await.is_ok()
    }
}

struct ChannelWorker {
    channel: ChannelKind,
    http: reqwest::Client,
    retry_delays_ms: Vec<u64>,
    max_attempts: u32,
    bucket: TokenBucket,
    max_wait: Duration,
}

impl ChannelWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Alert>) {
        let name = self.channel.name();
        while let Some(alert) = rx.recv().await {
            if !self.acquire_rate_slot().await {
                warn!(channel = name, mint = %alert.mint, "rate limit wait exceeded, dropping alert");
                continue;
            }
            self.send_with_retries(&alert).await;
        }
        debug!(channel = name, "alert worker drained and stopped");
    }

    async fn acquire_rate_slot(&mut self) -> bool {
        if self.bucket.try_acquire() {
            return true;
        }
        let wait_seconds = self.bucket.seconds_until_available();
        if wait_seconds > self.max_wait.as_secs_f64() {
            return false;
        }
        time::sleep(Duration::from_secs_f64(wait_seconds)).await;
        self.bucket.try_acquire()
    }

    async fn send_with_retries(&self, alert: &Alert) {
        let name = self.channel.name();
        let endpoint = self.channel.endpoint();
        let payload = self.channel.payload(alert);

        for attempt in 0..self.max_attempts {
            let decision = match self.http.post(&endpoint).json(&payload).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let mut retry_after = extract_retry_after(&response);
                    // Some webhooks put retry_after in the body instead; only
                    // a rate-limited response without the header is worth a
                    // body parse.
                    if status == 429 && retry_after.is_none() {
                        retry_after = match response.json::<Value>().await {
                            Ok(body) => body.get("retry_after").and_then(Value::as_f64),
                            Err(_) => None,
                        };
                    }
                    classify_response(status, retry_after)
                }
                Err(error) => {
                    debug!(channel = name, attempt, error = %error, "alert send network error");
                    SendDecision::RetryBackoff
                }
            };

            match decision {
                SendDecision::Delivered => {
                    info!(channel = name, mint = %alert.mint, "alert delivered");
                    return;
                }
                SendDecision::Drop => {
                    error!(channel = name, mint = %alert.mint, "alert rejected by channel, not retrying");
                    return;
                }
                SendDecision::RetryAfter(seconds) => {
                    if attempt + 1 >= self.max_attempts {
                        break;
                    }
                    warn!(channel = name, seconds, "channel rate limited, honoring retry_after");
                    time::sleep(Duration::from_secs_f64(seconds)).await;
                }
                SendDecision::RetryBackoff => {
                    if attempt + 1 >= self.max_attempts {
                        break;
                    }
                    let delay_ms = self
                        .retry_delays_ms
                        .get(attempt as usize)
                        .copied()
                        .unwrap_or_else(|| 1_000 * (1 << attempt.min(4)));
                    time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }

        error!(
            channel = name,
            mint = %alert.mint,
            attempts = self.max_attempts,
            "alert dropped after exhausting retries"
        );
    }
}

fn extract_retry_after(response: &reqwest::Response) -> Option<f64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_deliver() {
        assert_eq!(classify_response(200, None), SendDecision::Delivered);
        assert_eq!(classify_response(204, None), SendDecision::Delivered);
    }

    #[test]
    fn server_errors_retry_with_backoff() {
        assert_eq!(classify_response(500, None), SendDecision::RetryBackoff);
        assert_eq!(classify_response(599, None), SendDecision::RetryBackoff);
    }

    #[test]
    fn rate_limit_honors_retry_after() {
        assert_eq!(
            classify_response(429, Some(5.0)),
            SendDecision::RetryAfter(5.0)
        );
        assert_eq!(
            classify_response(429, None),
            SendDecision::RetryAfter(5.0),
            "missing retry_after falls back to a conservative delay"
        );
    }

    #[test]
    fn other_client_errors_drop_immediately() {
        assert_eq!(classify_response(400, None), SendDecision::Drop);
        assert_eq!(classify_response(404, None), SendDecision::Drop);
    }

    #[test]
    fn token_bucket_enforces_per_minute_rate() {
        let mut bucket = TokenBucket::new(2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire(), "bucket of 2 exhausts after 2 sends");
        assert!(bucket.seconds_until_available() > 0.0);
    }

    #[test]
    fn telegram_endpoint_embeds_the_bot_token() {
        let channel = ChannelKind::Telegram {
            bot_token: "12345:abc".to_string(),
            chat_id: "-1".to_string(),
        };
        assert_eq!(
            channel.endpoint(),
            "https://api.telegram.org/bot12345:abc/sendMessage"
        );
        assert_eq!(channel.name(), "telegram");
    }

    #[test]
    fn channels_from_config_respects_optional_settings() {
        let mut config = AlertsConfig::default();
        assert!(channels_from_config(&config).is_empty());

        config.discord_webhook_url = Some("https://discord.example/hook".to_string());
        config.telegram_bot_token = Some("token".to_string());
        config.telegram_chat_id = Some("chat".to_string());
        let channels = channels_from_config(&config);
        assert_eq!(channels.len(), 2);
    }
}
