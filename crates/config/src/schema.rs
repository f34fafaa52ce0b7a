use mintwatch_core_types::{CompareOp, Predicate, TriggerRule};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemConfig,
    pub stream: StreamConfig,
    pub detection: DetectionConfig,
    pub backpressure: BackpressureConfig,
    pub enrichment: EnrichmentConfig,
    pub alerts: AlertsConfig,
    pub sink: SinkConfig,
    pub delta_log: DeltaLogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub env: String,
    pub log_level: String,
    pub log_json: bool,
    pub metrics_bind: String,
    pub shutdown_deadline_seconds: u64,
    pub maintenance_interval_seconds: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            metrics_bind: "0.0.0.0:9100".to_string(),
            shutdown_deadline_seconds: 10,
            maintenance_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// "grpc" for the upstream subscription, "mock" for the synthetic feed.
    pub source: String,
    pub endpoint: String,
    pub token: String,
    pub counter_store_url: String,
    pub consumer_count: usize,
    pub consumer_name: String,
    pub stream_maxlen: usize,
    pub batch_size: usize,
    pub block_ms: u64,
    pub claim_min_idle_ms: u64,
    pub connect_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub program_ids: Vec<String>,
    pub mock_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source: "grpc".to_string(),
            endpoint: String::new(),
            token: String::new(),
            counter_store_url: "redis://127.0.0.1:6379/0".to_string(),
            consumer_count: 1,
            consumer_name: String::new(),
            stream_maxlen: 100_000,
            batch_size: 100,
            block_ms: 1_000,
            claim_min_idle_ms: 30_000,
            connect_timeout_ms: 5_000,
            subscribe_timeout_ms: 15_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 8_000,
            program_ids: vec![
                "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P".to_string(),
                "pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA".to_string(),
                "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8".to_string(),
            ],
            mock_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_swap_confidence: f64,
    pub dedup_ttl_seconds: u64,
    pub hot_ttl_seconds: u64,
    pub warm_ttl_seconds: u64,
    pub alert_cooldown_seconds: u64,
    pub min_alert_mcap_sol: f64,
    /// Native deltas below this (in SOL) are treated as fee/rent dust, not
    /// swap quote.
    pub min_native_delta_sol: f64,
    pub penalty_missing_venue: f64,
    pub penalty_competing_deltas: f64,
    pub penalty_fee_ratio: f64,
    pub penalty_unseen_mint: f64,
    pub seen_mint_cache_size: usize,
    pub triggers: Vec<TriggerRule>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_swap_confidence: 0.7,
            dedup_ttl_seconds: 600,
            hot_ttl_seconds: 3_600,
            warm_ttl_seconds: 1_800,
            alert_cooldown_seconds: 300,
            min_alert_mcap_sol: 500.0,
            min_native_delta_sol: 0.001,
            penalty_missing_venue: 0.1,
            penalty_competing_deltas: 0.2,
            penalty_fee_ratio: 0.1,
            penalty_unseen_mint: 0.05,
            seen_mint_cache_size: 10_000,
            triggers: default_triggers(),
        }
    }
}

fn default_triggers() -> Vec<TriggerRule> {
    vec![
        TriggerRule {
            name: "fast_accumulation_5m".to_string(),
            enabled: true,
            conditions: vec![
                predicate("buy_count_5m", CompareOp::Ge, 20.0),
                predicate("unique_buyers_5m", CompareOp::Ge, 5.0),
                predicate("buy_sell_ratio_5m", CompareOp::Ge, 3.0),
            ],
        },
        TriggerRule {
            name: "extreme_ratio_5m".to_string(),
            enabled: true,
            conditions: vec![
                predicate("buy_count_5m", CompareOp::Ge, 10.0),
                predicate("unique_buyers_5m", CompareOp::Ge, 3.0),
                predicate("sell_count_5m", CompareOp::Eq, 0.0),
            ],
        },
        TriggerRule {
            name: "slow_stealth_1h".to_string(),
            enabled: true,
            conditions: vec![
                predicate("buy_count_1h", CompareOp::Ge, 60.0),
                predicate("unique_buyers_1h", CompareOp::Ge, 12.0),
                predicate("top_3_buyers_volume_share_1h", CompareOp::Ge, 0.5),
            ],
        },
    ]
}

fn predicate(field: &str, op: CompareOp, value: f64) -> Predicate {
    Predicate {
        field: field.to_string(),
        op,
        value,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub lag_warn_s: u64,
    pub lag_crit_s: u64,
    pub buf_warn: usize,
    pub buf_crit: usize,
    pub sample_interval_ms: u64,
    pub recovery_samples: u32,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            lag_warn_s: 5,
            lag_crit_s: 30,
            buf_warn: 50_000,
            buf_crit: 80_000,
            sample_interval_ms: 1_000,
            recovery_samples: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub api_key: String,
    pub base_url: String,
    pub daily_credits: u64,
    /// "utc_midnight" or "rolling_24h"; the upstream never documented which
    /// one its quota uses.
    pub credit_reset: String,
    pub request_timeout_ms: u64,
    pub score_deadline_ms: u64,
    pub worker_pool_size: usize,
    pub funding_max_hops: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_recovery_seconds: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://mainnet.helius-rpc.com".to_string(),
            daily_credits: 500_000,
            credit_reset: "utc_midnight".to_string(),
            request_timeout_ms: 5_000,
            score_deadline_ms: 2_000,
            worker_pool_size: 4,
            funding_max_hops: 2,
            circuit_failure_threshold: 5,
            circuit_recovery_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub discord_webhook_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_delays_ms: Vec<u64>,
    pub rate_per_minute: u32,
    pub max_wait_ms: u64,
    pub request_timeout_ms: u64,
    pub send_test_message: bool,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            discord_webhook_url: None,
            telegram_bot_token: None,
            telegram_chat_id: None,
            queue_capacity: 256,
            max_attempts: 3,
            retry_delays_ms: vec![1_000, 2_000, 4_000],
            rate_per_minute: 30,
            max_wait_ms: 2_000,
            request_timeout_ms: 10_000,
            send_test_message: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub url: String,
    pub request_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeltaLogConfig {
    pub data_dir: String,
    pub retention_minutes: u64,
    pub rotate_max_bytes: u64,
    pub rotate_max_seconds: u64,
    pub queue_capacity: usize,
    pub flush_interval_ms: u64,
}

impl Default for DeltaLogConfig {
    fn default() -> Self {
        Self {
            data_dir: "state/delta-logs".to_string(),
            retention_minutes: 60,
            rotate_max_bytes: 64 * 1024 * 1024,
            rotate_max_seconds: 3_600,
            queue_capacity: 4_096,
            flush_interval_ms: 1_000,
        }
    }
}
