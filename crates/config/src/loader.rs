use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::env_parsing::{parse_env_bool, parse_required_env, require_env, validate};
use super::AppConfig;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Loads TOML defaults (when the file exists), then applies the environment
/// contract. Every variable the deployment contract marks mandatory must be
/// present or this errors before any side effect.
pub fn load_from_env_or_default(default_path: &Path) -> Result<(AppConfig, PathBuf)> {
    let configured = env::var("MINTWATCH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_path.to_path_buf());

    let mut config = if configured.exists() {
        let raw = fs::read_to_string(&configured)
            .with_context(|| format!("failed to read config: {}", configured.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse TOML: {}", configured.display()))?
    } else {
        AppConfig::default()
    };

    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok((config, configured))
}

fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    // Mandatory deployment contract.
    config.stream.endpoint = require_env("STREAM_ENDPOINT")?;
    config.stream.token = require_env("STREAM_TOKEN")?;
    config.stream.counter_store_url = require_env("COUNTER_STORE_URL")?;
    config.sink.url = require_env("APPEND_SINK_URL")?;
    config.enrichment.api_key = require_env("ENRICHMENT_API_KEY")?;
    config.backpressure.lag_warn_s = parse_required_env("BP_LAG_WARN_S")?;
    config.backpressure.lag_crit_s = parse_required_env("BP_LAG_CRIT_S")?;
    config.backpressure.buf_warn = parse_required_env("BP_BUF_WARN")?;
    config.backpressure.buf_crit = parse_required_env("BP_BUF_CRIT")?;

    // Optional overrides with defaults.
    if let Some(count) = env::var("STREAM_CONSUMER_COUNT")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
    {
        config.stream.consumer_count = count;
    }
    if let Ok(name) = env::var("CONSUMER_NAME") {
        let trimmed = name.trim();
        if !trimmed.is_empty() {
            config.stream.consumer_name = trimmed.to_string();
        }
    }
    if let Some(credits) = env::var("ENRICHMENT_DAILY_CREDITS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.enrichment.daily_credits = credits;
    }
    if let Ok(url) = env::var("DISCORD_WEBHOOK_URL") {
        let trimmed = url.trim();
        if !trimmed.is_empty() {
            config.alerts.discord_webhook_url = Some(trimmed.to_string());
        }
    }
    if let Ok(token) = env::var("TELEGRAM_BOT_TOKEN") {
        let trimmed = token.trim();
        if !trimmed.is_empty() {
            config.alerts.telegram_bot_token = Some(trimmed.to_string());
        }
    }
    if let Ok(chat_id) = env::var("TELEGRAM_CHAT_ID") {
        let trimmed = chat_id.trim();
        if !trimmed.is_empty() {
            config.alerts.telegram_chat_id = Some(trimmed.to_string());
        }
    }
    if let Some(ttl) = env::var("HOT_TOKEN_TTL_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.detection.hot_ttl_seconds = ttl;
    }
    if let Some(cooldown) = env::var("ALERT_COOLDOWN_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.detection.alert_cooldown_seconds = cooldown;
    }
    if let Some(floor) = env::var("MIN_SWAP_CONFIDENCE")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
    {
        config.detection.min_swap_confidence = floor;
    }

    // Supplementary knobs outside the deployment contract.
    if let Ok(source) = env::var("MINTWATCH_STREAM_SOURCE") {
        let trimmed = source.trim();
        if !trimmed.is_empty() {
            config.stream.source = trimmed.to_string();
        }
    }
    if let Ok(level) = env::var("MINTWATCH_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.system.log_level = trimmed.to_string();
        }
    }
    if let Some(json) = env::var("MINTWATCH_LOG_JSON").ok().and_then(parse_env_bool) {
        config.system.log_json = json;
    }
    if let Ok(bind) = env::var("MINTWATCH_METRICS_BIND") {
        let trimmed = bind.trim();
        if !trimmed.is_empty() {
            config.system.metrics_bind = trimmed.to_string();
        }
    }
    if let Ok(data_dir) = env::var("MINTWATCH_DELTA_LOG_DIR") {
        let trimmed = data_dir.trim();
        if !trimmed.is_empty() {
            config.delta_log.data_dir = trimmed.to_string();
        }
    }

    Ok(())
}
