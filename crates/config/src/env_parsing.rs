use anyhow::{anyhow, Result};

use super::AppConfig;

pub(crate) fn parse_env_bool(value: String) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn require_env(name: &str) -> Result<String> {
    let value = std::env::var(name)
        .map_err(|_| anyhow!("required environment variable {name} is not set"))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("required environment variable {name} is empty"));
    }
    Ok(trimmed.to_string())
}

pub(crate) fn parse_required_env<T>(name: &str) -> Result<T>
where
    T: std::str::FromStr,
{
    let raw = require_env(name)?;
    raw.parse::<T>()
        .map_err(|_| anyhow!("{name} is not a valid value: {raw}"))
}

/// Cross-field checks run after every load path. A config that passes here is
/// safe to hand to the orchestrator.
pub(crate) fn validate(config: &AppConfig) -> Result<()> {
    if config.backpressure.lag_warn_s >= config.backpressure.lag_crit_s {
        return Err(anyhow!(
            "backpressure.lag_warn_s ({}) must be below backpressure.lag_crit_s ({})",
            config.backpressure.lag_warn_s,
            config.backpressure.lag_crit_s
        ));
    }
    if config.backpressure.buf_warn >= config.backpressure.buf_crit {
        return Err(anyhow!(
            "backpressure.buf_warn ({}) must be below backpressure.buf_crit ({})",
            config.backpressure.buf_warn,
            config.backpressure.buf_crit
        ));
    }
    if !(0.0..=1.0).contains(&config.detection.min_swap_confidence) {
        return Err(anyhow!(
            "detection.min_swap_confidence must be within [0, 1], got {}",
            config.detection.min_swap_confidence
        ));
    }
    if config.stream.consumer_count == 0 {
        return Err(anyhow!("stream.consumer_count must be at least 1"));
    }
    if config.alerts.telegram_bot_token.is_some() != config.alerts.telegram_chat_id.is_some() {
        return Err(anyhow!(
            "alerts.telegram_bot_token and alerts.telegram_chat_id must be set together"
        ));
    }
    for rule in &config.detection.triggers {
        if rule.conditions.is_empty() {
            return Err(anyhow!("trigger rule {} has no conditions", rule.name));
        }
    }
    Ok(())
}
