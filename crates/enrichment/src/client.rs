use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use mintwatch_config::EnrichmentConfig;
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct FundingInfo {
    pub funder: String,
    pub hops: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenMetadata {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSupply {
    pub supply: f64,
    pub decimals: u8,
}

/// Daily credit budget for the enrichment service. The reset policy defaults
/// to UTC midnight; the upstream never documented its own boundary.
pub struct CreditBudget {
    daily_limit: u64,
    used: AtomicU64,
    rolling: bool,
    window_start: AtomicI64,
}

impl CreditBudget {
    pub fn new(daily_limit: u64, reset_policy: &str) -> Self {
        Self {
            daily_limit,
            used: AtomicU64::new(0),
            rolling: reset_policy.eq_ignore_ascii_case("rolling_24h"),
            window_start: AtomicI64::new(0),
        }
    }

    /// Charges `credits` against the budget. Returns false once the day's
    /// budget is spent; callers degrade instead of calling out.
    pub fn charge(&self, credits: u64, now: DateTime<Utc>) -> bool {
        let marker = if self.rolling {
            now.timestamp()
        } else {
            now.timestamp().div_euclid(86_400)
        };
        let current = self.window_start.load(Ordering::Relaxed);
        let window_expired = if self.rolling {
            marker - current >= 86_400
        } else {
            marker != current
        };
        if window_expired
            && self
                .window_start
                .compare_exchange(current, marker, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.used.store(0, Ordering::Relaxed);
            debug!("enrichment credit window reset");
        }

        let used = self.used.fetch_add(credits, Ordering::Relaxed) + credits;
        used <= self.daily_limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.used.load(Ordering::Relaxed) >= self.daily_limit
    }
}

/// Trips after consecutive failures and blocks calls until the recovery
/// timeout passes, so a struggling upstream is not hammered.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery: Duration,
    failures: AtomicU32,
    open_since_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery,
            failures: AtomicU32::new(0),
            open_since_ms: AtomicI64::new(0),
        }
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let opened = self.open_since_ms.load(Ordering::Relaxed);
        if opened == 0 {
            return false;
        }
        if now.timestamp_millis() - opened >= self.recovery.as_millis() as i64 {
            self.open_since_ms.store(0, Ordering::Relaxed);
            self.failures.store(0, Ordering::Relaxed);
            info!("enrichment circuit breaker reset");
            return false;
        }
        true
    }

    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.failure_threshold {
            if self
                .open_since_ms
                .compare_exchange(
                    0,
                    now.timestamp_millis(),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                warn!(failures, "enrichment circuit breaker opened");
            }
        }
    }
}

/// HTTP client for the wallet-funding and token-metadata service. Every call
/// charges the credit budget and flows through the circuit breaker.
pub struct EnrichmentClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    credits: CreditBudget,
    breaker: CircuitBreaker,
    max_hops: u32,
}

impl EnrichmentClient {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(500)))
            .build()
            .context("failed building enrichment client")?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            credits: CreditBudget::new(config.daily_credits, &config.credit_reset),
            breaker: CircuitBreaker::new(
                config.circuit_failure_threshold,
                Duration::from_secs(config.circuit_recovery_seconds),
            ),
            max_hops: config.funding_max_hops.max(1),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.credits.is_exhausted() || self.breaker.is_open(Utc::now())
    }

    /// Resolves the wallet that first funded `wallet`, following redirected
    /// funders up to the configured hop limit.
    pub async fn trace_funding(&self, wallet: &str) -> Result<Option<FundingInfo>> {
        let mut current = wallet.to_string();
        let mut hops = 0;
        let mut resolved: Option<FundingInfo> = None;

        while hops < self.max_hops {
            let url = format!("{}/v0/wallets/{current}/funding", self.base_url);
            let Some(step) = self.get_json::<FundingInfo>(&url).await? else {
                break;
            };
            hops += 1;
            resolved = Some(FundingInfo {
                funder: step.funder.clone(),
                hops,
            });
            if step.funder == current {
                break;
            }
            current = step.funder;
        }
        Ok(resolved)
    }

    pub async fn token_metadata(&self, mint: &str) -> Result<Option<TokenMetadata>> {
        let url = format!("{}/v0/tokens/{mint}/metadata", self.base_url);
        self.get_json(&url).await
    }

    pub async fn token_supply(&self, mint: &str) -> Result<Option<TokenSupply>> {
        let url = format!("{}/v0/tokens/{mint}/supply", self.base_url);
        self.get_json(&url).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        let now = Utc::now();
        if self.breaker.is_open(now) {
            return Err(anyhow!("enrichment circuit breaker is open"));
        }
        if !self.credits.charge(1, now) {
            return Err(anyhow!("enrichment daily credit budget exhausted"));
        }

        let response = self
            .http
            .get(url)
            .header("x-api-key", &self.api_key)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                self.breaker.record_failure(Utc::now());
                return Err(error).with_context(|| format!("enrichment GET failed: {url}"));
            }
        };

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            self.breaker.record_success();
            return Ok(None);
        }
        if !response.status().is_success() {
            self.breaker.record_failure(Utc::now());
            return Err(anyhow!(
                "enrichment returned status {} for {url}",
                response.status()
            ));
        }

        self.breaker.record_success();
        let parsed = response
            .json::<T>()
            .await
            .with_context(|| format!("failed decoding enrichment response: {url}"))?;
        Ok(Some(parsed))
    }
}

/// Market cap implied by one swap's price and the cached token supply.
pub fn estimate_mcap_sol(
    quote_sol: f64,
    base_amount: f64,
    supply: &TokenSupply,
) -> Option<f64> {
    if base_amount <= 0.0 || quote_sol <= 0.0 || supply.supply <= 0.0 {
        return None;
    }
    let price_per_token = quote_sol / base_amount;
    let whole_supply = supply.supply / 10f64.powi(supply.decimals as i32);
    Some(price_per_token * whole_supply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn credit_budget_blocks_after_limit() {
        let budget = CreditBudget::new(3, "utc_midnight");
        let now = Utc::now();
        assert!(budget.charge(1, now));
        assert!(budget.charge(2, now));
        assert!(!budget.charge(1, now));
        assert!(budget.is_exhausted());
    }

    #[test]
    fn credit_budget_resets_at_utc_midnight() {
        let budget = CreditBudget::new(2, "utc_midnight");
        let day_one = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).single().expect("ts");
        assert!(budget.charge(2, day_one));
        assert!(!budget.charge(1, day_one));

        let day_two = Utc.with_ymd_and_hms(2026, 3, 2, 0, 1, 0).single().expect("ts");
        assert!(budget.charge(1, day_two), "new UTC day resets the budget");
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("ts");

        assert!(!breaker.is_open(now));
        breaker.record_failure(now);
        assert!(!breaker.is_open(now));
        breaker.record_failure(now);
        assert!(breaker.is_open(now + chrono::Duration::seconds(1)));
        assert!(!breaker.is_open(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn success_resets_the_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        let now = Utc::now();
        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        assert!(!breaker.is_open(now));
    }

    #[test]
    fn mcap_estimate_scales_price_by_whole_supply() {
        let supply = TokenSupply {
            supply: 1_000_000_000_000_000.0,
            decimals: 6,
        };
        // 0.5 SOL for 100 tokens -> 0.005 SOL/token * 1e9 tokens.
        let mcap = estimate_mcap_sol(0.5, 100.0, &supply).expect("mcap");
        assert!((mcap - 5_000_000.0).abs() < 1.0, "mcap {mcap}");

        assert!(estimate_mcap_sol(0.5, 0.0, &supply).is_none());
    }
}
