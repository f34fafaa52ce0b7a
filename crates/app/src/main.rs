mod consumer;
mod detector;
mod ingest;
mod metrics;
mod pipeline;
mod source;

use anyhow::{Context, Result};
use chrono::Utc;
use mintwatch_alerting::AlertDispatcher;
use mintwatch_config::load_from_env_or_default;
use mintwatch_core_types::{Alert, CtoScore};
use mintwatch_deltalog::DeltaLog;
use mintwatch_detection::{
    BackpressureController, RuleSet, StateManager, StateParams, Thresholds, TriggerEvaluator,
};
use mintwatch_enrichment::{EnrichmentClient, ScoreService, WalletClusterer};
use mintwatch_store::{
    AppendSink, ConfigChannel, CounterStore, DedupFilter, DurableStream, RedisStore, TokenKeys,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::consumer::{consumer_name, run_consumer, ConsumerSettings};
use crate::detector::{
    run_backfill_worker, run_backpressure_sampler, run_detector_loop, run_reload_listener,
    DetectorContext,
};
use crate::ingest::run_ingest;
use crate::metrics::{spawn_metrics_server, Metrics};
use crate::pipeline::SwapPipeline;
use crate::source::TxSource;

const DEFAULT_CONFIG_PATH: &str = "configs/dev.toml";
const DETECTOR_TICK_SECONDS: u64 = 1;
const BACKFILL_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Roles {
    ingest: bool,
    consume: bool,
    detect: bool,
}

impl Roles {
    fn label(&self) -> &'static str {
        match (self.ingest, self.consume, self.detect) {
            (true, true, true) => "all",
            (true, false, false) => "ingest-only",
            (false, true, false) => "consume-only",
            (false, false, true) => "detect-only",
            _ => "custom",
        }
    }
}

fn parse_roles() -> Roles {
    let mut roles = Roles {
        ingest: true,
        consume: true,
        detect: true,
    };
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--ingest-only" => {
                roles = Roles {
                    ingest: true,
                    consume: false,
                    detect: false,
                }
            }
            "--consume-only" => {
                roles = Roles {
                    ingest: false,
                    consume: true,
                    detect: false,
                }
            }
            "--detect-only" => {
                roles = Roles {
                    ingest: false,
                    consume: false,
                    detect: true,
                }
            }
            _ => {}
        }
    }
    roles
}

fn parse_config_arg() -> Option<PathBuf> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(inline) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(inline));
        }
    }
    None
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if json {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let roles = parse_roles();
    let cli_config = parse_config_arg();
    let default_path = cli_config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    // Missing mandatory environment fails here, before any side effect.
    let (config, loaded_config_path) = load_from_env_or_default(&default_path)?;

    init_tracing(&config.system.log_level, config.system.log_json);
    info!(
        config_path = %loaded_config_path.display(),
        env = %config.system.env,
        roles = roles.label(),
        "configuration loaded"
    );

    let store = RedisStore::connect(&config.stream.counter_store_url)
        .await
        .context("failed to open counter store connection")?;
    let stream = DurableStream::new(&store, config.stream.stream_maxlen);
    stream
        .ensure_group()
        .await
        .context("failed to prepare durable stream")?;

    let (delta_log, delta_log_task) = DeltaLog::start(&config.delta_log)?;
    let sink = AppendSink::new(&config.sink)?;
    let enrichment =
        Arc::new(EnrichmentClient::new(&config.enrichment).context("failed enrichment client")?);
    let clusterer = Arc::new(WalletClusterer::new());
    let (state, backfill_rx) = StateManager::new(
        StateParams {
            hot_ttl_seconds: config.detection.hot_ttl_seconds,
            warm_ttl_seconds: config.detection.warm_ttl_seconds,
            alert_cooldown_seconds: config.detection.alert_cooldown_seconds,
        },
        BACKFILL_QUEUE_CAPACITY,
    );
    let state = Arc::new(state);

    let controller = Arc::new(BackpressureController::new(
        Thresholds {
            lag_warn_s: config.backpressure.lag_warn_s as f64,
            lag_crit_s: config.backpressure.lag_crit_s as f64,
            buf_warn: config.backpressure.buf_warn,
            buf_crit: config.backpressure.buf_crit,
        },
        config.backpressure.recovery_samples,
    ));
    let mode_cell = controller.mode_cell();
    let metrics = Arc::new(Metrics::default());

    let pipeline = Arc::new(SwapPipeline::new(
        &config.detection,
        CounterStore::new(&store),
        delta_log.clone(),
        sink,
        Arc::clone(&state),
        Arc::clone(&clusterer),
        TokenKeys::new(&store),
        Arc::clone(&mode_cell),
        Arc::clone(&metrics),
        Arc::clone(&enrichment),
    ));

    let evaluator = Arc::new(TriggerEvaluator::new(
        RuleSet::compile(&config.detection.triggers).context("invalid trigger rules")?,
    ));
    let score = Arc::new(ScoreService::new(
        Arc::clone(&clusterer),
        config.enrichment.worker_pool_size,
        Duration::from_millis(config.enrichment.score_deadline_ms),
    ));
    let dispatcher = Arc::new(AlertDispatcher::start(&config.alerts)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(String, JoinHandle<()>)> = Vec::new();

    let metrics_server = spawn_metrics_server(
        config.system.metrics_bind.clone(),
        Arc::clone(&metrics),
        Arc::clone(&mode_cell),
    );

    if roles.ingest {
        let source = TxSource::from_config(&config.stream)?;
        tasks.push((
            "ingest".to_string(),
            tokio::spawn(run_ingest(
                source,
                stream.clone(),
                Arc::clone(&metrics),
                shutdown_rx.clone(),
            )),
        ));
    }

    if roles.consume {
        let dedup = DedupFilter::new(&store, config.detection.dedup_ttl_seconds);
        for index in 0..config.stream.consumer_count.max(1) {
            let name = if config.stream.consumer_name.trim().is_empty() {
                consumer_name(index)
            } else if config.stream.consumer_count > 1 {
                format!("{}-{index}", config.stream.consumer_name.trim())
            } else {
                config.stream.consumer_name.trim().to_string()
            };
            tasks.push((
                format!("consumer-{index}"),
                tokio::spawn(run_consumer(
                    name,
                    stream.clone(),
                    dedup.clone(),
                    Arc::clone(&pipeline),
                    ConsumerSettings {
                        batch_size: config.stream.batch_size,
                        block_ms: config.stream.block_ms,
                        claim_min_idle_ms: config.stream.claim_min_idle_ms,
                        seen_mint_cache_size: config.detection.seen_mint_cache_size,
                    },
                    shutdown_rx.clone(),
                )),
            ));
        }
    }

    if roles.consume {
        tasks.push((
            "maintenance".to_string(),
            tokio::spawn(detector::run_maintenance_loop(
                stream.clone(),
                Arc::clone(&pipeline),
                config.stream.stream_maxlen,
                Duration::from_secs(config.system.maintenance_interval_seconds.max(10)),
                shutdown_rx.clone(),
            )),
        ));
    }

    if roles.consume || roles.detect {
        tasks.push((
            "backpressure-sampler".to_string(),
            tokio::spawn(run_backpressure_sampler(
                stream.clone(),
                Arc::clone(&controller),
                Arc::clone(&pipeline),
                Duration::from_millis(config.backpressure.sample_interval_ms.max(100)),
                shutdown_rx.clone(),
            )),
        ));
    }

    if roles.detect {
        tasks.push((
            "detector".to_string(),
            tokio::spawn(run_detector_loop(
                DetectorContext {
                    pipeline: Arc::clone(&pipeline),
                    evaluator: Arc::clone(&evaluator),
                    score: Arc::clone(&score),
                    dispatcher: Arc::clone(&dispatcher),
                    min_alert_mcap_sol: config.detection.min_alert_mcap_sol,
                },
                Duration::from_secs(DETECTOR_TICK_SECONDS),
                shutdown_rx.clone(),
            )),
        ));
        tasks.push((
            "backfill".to_string(),
            tokio::spawn(run_backfill_worker(
                Arc::clone(&pipeline),
                backfill_rx,
                config.delta_log.retention_minutes,
                shutdown_rx.clone(),
            )),
        ));

        let config_channel = ConfigChannel::new(&store);
        let (reload_rx, reload_task) = config_channel
            .subscribe_reloads()
            .await
            .context("failed subscribing to config reload channel")?;
        tasks.push(("reload-pubsub".to_string(), reload_task));
        tasks.push((
            "reload-listener".to_string(),
            tokio::spawn(run_reload_listener(
                config_channel,
                reload_rx,
                Arc::clone(&evaluator),
                Arc::clone(&controller),
                Arc::clone(&pipeline),
                shutdown_rx.clone(),
            )),
        ));

        if config.alerts.send_test_message && dispatcher.channel_count() > 0 {
            dispatcher.dispatch(&startup_test_alert());
        }
    }

    info!(tasks = tasks.len(), "mintwatch started");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let deadline = Duration::from_secs(config.system.shutdown_deadline_seconds.max(1));
    let drain = async {
        for (name, handle) in tasks {
            if let Err(error) = handle.await {
                warn!(task = %name, error = %error, "task join failed during shutdown");
            }
        }
    };
    if time::timeout(deadline, drain).await.is_err() {
        warn!(
            deadline_seconds = deadline.as_secs(),
            "background tasks did not stop within the shutdown deadline"
        );
    }

    if let Err(error) = delta_log.flush().await {
        warn!(error = %error, "final delta log flush failed");
    }
    drop(pipeline);
    drop(delta_log);
    let _ = time::timeout(deadline, delta_log_task.handle).await;

    match Arc::try_unwrap(dispatcher) {
        Ok(dispatcher) => {
            if !dispatcher.shutdown(deadline).await {
                warn!("alert queues did not drain within the shutdown deadline");
            }
        }
        Err(_) => {
            warn!("alert dispatcher still referenced at shutdown, skipping drain");
        }
    }

    metrics_server.abort();
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                warn!(error = %error, "failed installing SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn startup_test_alert() -> Alert {
    Alert {
        id: Uuid::new_v4(),
        mint: "startup-test".to_string(),
        token_symbol: Some("MINTWATCH".to_string()),
        token_name: Some("mintwatch connectivity check".to_string()),
        token_image: None,
        trigger_name: "startup_test".to_string(),
        trigger_reason: "channel connectivity check on startup".to_string(),
        venue: None,
        volume_sol_5m: 0.0,
        buy_count_5m: 0,
        sell_count_5m: 0,
        unique_buyers_5m: 0,
        buy_sell_ratio_5m: 0.0,
        mcap_sol: None,
        avg_entry_mcap: None,
        cto_score: 0.0,
        cto_components: CtoScore::default(),
        top_buyers: Vec::new(),
        clusters: Vec::new(),
        enrichment_degraded: false,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roles_run_everything() {
        let roles = Roles {
            ingest: true,
            consume: true,
            detect: true,
        };
        assert_eq!(roles.label(), "all");
    }

    #[test]
    fn startup_alert_is_inert() {
        let alert = startup_test_alert();
        assert_eq!(alert.trigger_name, "startup_test");
        assert_eq!(alert.buy_count_5m, 0);
        assert!(alert.clusters.is_empty());
    }
}
