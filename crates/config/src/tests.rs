use super::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

static ENV_LOCK: Mutex<()> = Mutex::new(());
static TEMP_CONFIG_COUNTER: AtomicU64 = AtomicU64::new(0);

const MANDATORY_ENV: &[(&str, &str)] = &[
    ("STREAM_ENDPOINT", "https://grpc.example.com"),
    ("STREAM_TOKEN", "test-token"),
    ("COUNTER_STORE_URL", "redis://127.0.0.1:6379/1"),
    ("APPEND_SINK_URL", "https://sink.example.com/ingest"),
    ("ENRICHMENT_API_KEY", "enrich-key"),
    ("BP_LAG_WARN_S", "5"),
    ("BP_LAG_CRIT_S", "30"),
    ("BP_BUF_WARN", "50000"),
    ("BP_BUF_CRIT", "80000"),
];

fn with_mandatory_env<F: FnOnce()>(overrides: &[(&str, &str)], body: F) {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for (name, value) in MANDATORY_ENV {
        std::env::set_var(name, value);
    }
    for (name, value) in overrides {
        std::env::set_var(name, value);
    }
    body();
    for (name, _) in MANDATORY_ENV.iter().chain(overrides.iter()) {
        std::env::remove_var(name);
    }
}

fn missing_config_path() -> std::path::PathBuf {
    let nonce = TEMP_CONFIG_COUNTER.fetch_add(1, Ordering::Relaxed);
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("mintwatch-config-{stamp}-{nonce}.toml"))
}

#[test]
fn defaults_match_deployment_contract() {
    let config = AppConfig::default();
    assert_eq!(config.detection.min_swap_confidence, 0.7);
    assert_eq!(config.detection.dedup_ttl_seconds, 600);
    assert_eq!(config.detection.hot_ttl_seconds, 3_600);
    assert_eq!(config.detection.alert_cooldown_seconds, 300);
    assert_eq!(config.stream.consumer_count, 1);
    assert_eq!(config.stream.claim_min_idle_ms, 30_000);
    assert_eq!(config.enrichment.daily_credits, 500_000);
    assert_eq!(config.delta_log.retention_minutes, 60);
    assert_eq!(config.delta_log.rotate_max_bytes, 64 * 1024 * 1024);
    assert!(!config.detection.triggers.is_empty());
}

#[test]
fn load_fails_fast_when_mandatory_env_missing() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    for (name, _) in MANDATORY_ENV {
        std::env::remove_var(name);
    }
    let err = load_from_env_or_default(&missing_config_path())
        .expect_err("missing STREAM_ENDPOINT must fail before startup")
        .to_string();
    assert!(err.contains("STREAM_ENDPOINT"), "unexpected error: {err}");
}

#[test]
fn load_applies_mandatory_and_optional_env() {
    with_mandatory_env(
        &[
            ("STREAM_CONSUMER_COUNT", "3"),
            ("HOT_TOKEN_TTL_SECONDS", "7200"),
            ("MIN_SWAP_CONFIDENCE", "0.8"),
            ("DISCORD_WEBHOOK_URL", "https://discord.example.com/hook"),
        ],
        || {
            let (config, _) = load_from_env_or_default(&missing_config_path())
                .expect("mandatory env present, load should succeed");
            assert_eq!(config.stream.endpoint, "https://grpc.example.com");
            assert_eq!(config.stream.consumer_count, 3);
            assert_eq!(config.detection.hot_ttl_seconds, 7_200);
            assert_eq!(config.detection.min_swap_confidence, 0.8);
            assert_eq!(
                config.alerts.discord_webhook_url.as_deref(),
                Some("https://discord.example.com/hook")
            );
            assert_eq!(config.backpressure.buf_crit, 80_000);
        },
    );
}

#[test]
fn load_rejects_inverted_backpressure_thresholds() {
    with_mandatory_env(&[("BP_LAG_WARN_S", "30"), ("BP_LAG_CRIT_S", "5")], || {
        let err = load_from_env_or_default(&missing_config_path())
            .expect_err("warn threshold above crit must fail validation")
            .to_string();
        assert!(err.contains("lag_warn_s"), "unexpected error: {err}");
    });
}

#[test]
fn load_rejects_telegram_token_without_chat_id() {
    with_mandatory_env(&[("TELEGRAM_BOT_TOKEN", "bot-token")], || {
        let err = load_from_env_or_default(&missing_config_path())
            .expect_err("telegram token without chat id must fail")
            .to_string();
        assert!(err.contains("telegram"), "unexpected error: {err}");
    });
}

#[test]
fn toml_triggers_parse_into_typed_rules() {
    let raw = r#"
        [[detection.triggers]]
        name = "custom_rule"
        conditions = [
            { field = "buy_count_5m", op = ">=", value = 15 },
            { field = "new_wallet_pct_5m", op = ">", value = 0.5 },
        ]
    "#;
    let config: AppConfig = toml::from_str(raw).expect("trigger TOML parses");
    assert_eq!(config.detection.triggers.len(), 1);
    assert_eq!(config.detection.triggers[0].name, "custom_rule");
    assert_eq!(config.detection.triggers[0].conditions.len(), 2);
}
