use anyhow::{Context, Result};
use mintwatch_config::SinkConfig;
use mintwatch_core_types::{Alert, SwapEvent};
use std::time::Duration;
use tokio::time;
use tracing::debug;

const SINK_WRITE_MAX_RETRIES: usize = 3;
const SINK_WRITE_RETRY_BACKOFF_MS: [u64; SINK_WRITE_MAX_RETRIES] = [50, 125, 250];

/// Client for the append-only swap/alert sink. The server batches writes on
/// its side; a 2xx response means the record was admitted, which is all the
/// pipeline waits for.
#[derive(Clone)]
pub struct AppendSink {
    client: reqwest::Client,
    base_url: String,
}

impl AppendSink {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(500)))
            .build()
            .context("failed building append sink client")?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn append_swap(&self, swap: &SwapEvent) -> Result<()> {
        self.post_with_retry("swaps", &serde_json::to_value(swap)?)
            .await
    }

    pub async fn append_alert(&self, alert: &Alert) -> Result<()> {
        self.post_with_retry("alerts", &serde_json::to_value(alert)?)
            .await
    }

    async fn post_with_retry(&self, path: &str, payload: &serde_json::Value) -> Result<()> {
        let url = format!("{}/{path}", self.base_url);
        let mut last_error = None;
        for attempt in 0..=SINK_WRITE_MAX_RETRIES {
            match self.post_once(&url, payload).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    if attempt < SINK_WRITE_MAX_RETRIES {
                        let backoff_ms = SINK_WRITE_RETRY_BACKOFF_MS[attempt];
                        debug!(
                            attempt = attempt + 1,
                            backoff_ms,
                            error = %error,
                            "retrying append sink write"
                        );
                        time::sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.expect("retry loop records an error before exhausting"))
    }

    async fn post_once(&self, url: &str, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("append sink POST failed: {url}"))?;
        response
            .error_for_status()
            .with_context(|| format!("append sink rejected write: {url}"))?;
        Ok(())
    }
}
