use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use mintwatch_alerting::AlertDispatcher;
use mintwatch_core_types::{ratio_for_wire, Alert};
use mintwatch_detection::{BackpressureController, Thresholds, TriggerEvaluator, TriggerFire};
use mintwatch_enrichment::ScoreService;
use mintwatch_store::{ConfigChannel, DurableStream};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::SwapPipeline;

/// Under DEGRADED mode the tick evaluates at most this many mints.
const DEGRADED_EVAL_CAP: usize = 500;

pub struct DetectorContext {
    pub pipeline: Arc<SwapPipeline>,
    pub evaluator: Arc<TriggerEvaluator>,
    pub score: Arc<ScoreService>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub min_alert_mcap_sol: f64,
}

/// Detector tick: demote expired tokens, evaluate triggers for active
/// non-HOT mints, promote and alert on fires. Runs every second so a
/// satisfied rule fires within one tick under NORMAL mode.
pub async fn run_detector_loop(
    ctx: DetectorContext,
    tick_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = time::interval(tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!("detector loop started");

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let now = Utc::now();
        let state = &ctx.pipeline.state;
        let transitions = state.tick(now);
        for mint in &transitions.demoted_to_warm {
            if let Err(error) = ctx.pipeline.tokens.clear_hot(mint).await {
                debug!(mint, error = %error, "failed clearing hot marker");
            }
        }
        for mint in &transitions.demoted_to_cold {
            ctx.pipeline.forget_mint(mint);
        }

        let metrics = &ctx.pipeline.metrics;
        metrics.set(&metrics.hot_tokens, state.hot_mints().len() as u64);
        let mut mints = state.active_mints();
        metrics.set(&metrics.active_mints, mints.len() as u64);

        let mode = ctx.pipeline.mode.load();
        if mode == mintwatch_core_types::Mode::Critical {
            continue;
        }
        if mode == mintwatch_core_types::Mode::Degraded && mints.len() > DEGRADED_EVAL_CAP {
            mints.truncate(DEGRADED_EVAL_CAP);
        }

        for mint in mints {
            if state.is_hot(&mint) {
                continue;
            }
            let snapshot = match ctx.pipeline.counters.snapshot(&mint, now).await {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!(mint, error = %error, "snapshot read failed");
                    continue;
                }
            };
            if let Some(fire) = ctx.evaluator.evaluate(&snapshot) {
                if let Err(error) = handle_fire(&ctx, &mint, &snapshot, fire).await {
                    warn!(mint, error = %error, "trigger handling failed");
                }
            }
        }
    }
    info!("detector loop stopped");
}

async fn handle_fire(
    ctx: &DetectorContext,
    mint: &str,
    snapshot: &mintwatch_core_types::MintSnapshot,
    fire: TriggerFire,
) -> Result<()> {
    let now = Utc::now();
    let pipeline = &ctx.pipeline;
    let metrics = &pipeline.metrics;
    metrics.incr(&metrics.triggers_fired);
    info!(mint, rule = %fire.rule_name, "trigger fired");

    // Micro-caps below the floor are overwhelmingly rugs; skip both the
    // promotion and the alert.
    let cached_mcap = pipeline.tokens.get_mcap(mint).await.unwrap_or(None);
    if let Some((mcap_sol, _)) = cached_mcap {
        if mcap_sol < ctx.min_alert_mcap_sol {
            info!(mint, mcap_sol, "skipping promotion, mcap below floor");
            return Ok(());
        }
    }

    pipeline.state.promote_hot(mint, now);
    let hot_ttl = pipeline.state.hot_ttl_seconds();
    if let Err(error) = pipeline.tokens.mark_hot(mint, hot_ttl).await {
        warn!(mint, error = %error, "failed mirroring hot marker");
    }

    spawn_funding_enrichment(ctx, mint, snapshot);

    if !pipeline.state.cooldown_allows_alert(mint, now) {
        metrics.incr(&metrics.alerts_suppressed);
        info!(mint, rule = %fire.rule_name, "alert suppressed by cooldown");
        return Ok(());
    }

    let alert = build_alert(ctx, mint, snapshot, &fire, cached_mcap.map(|(mcap, _)| mcap)).await;
    if let Err(error) = pipeline.sink.append_alert(&alert).await {
        metrics.incr(&metrics.sink_failures);
        warn!(mint, error = %error, "alert persist failed");
    }
    ctx.dispatcher.dispatch(&alert);
    metrics.incr(&metrics.alerts_sent);
    pipeline.state.note_alert(mint, now);
    Ok(())
}

/// Funding traces run off the detector path; unions land in the shared
/// clusterer as they resolve and refine later scores.
fn spawn_funding_enrichment(
    ctx: &DetectorContext,
    mint: &str,
    snapshot: &mintwatch_core_types::MintSnapshot,
) {
    let enrichment = Arc::clone(&ctx.pipeline.enrichment);
    if enrichment.is_degraded() {
        debug!(mint, "skipping funding enrichment, service degraded");
        return;
    }
    let clusterer = Arc::clone(&ctx.pipeline.clusterer);
    let wallets: Vec<String> = snapshot
        .stats_5m
        .top_buyers
        .iter()
        .map(|(wallet, _)| wallet.clone())
        .collect();
    let mint = mint.to_string();

    tokio::spawn(async move {
        for wallet in wallets {
            match enrichment.trace_funding(&wallet).await {
                Ok(Some(funding)) => {
                    clusterer.link_funding(&wallet, &funding.funder);
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(mint = %mint, wallet = %wallet, error = %error, "funding trace failed");
                    break;
                }
            }
        }
    });
}

async fn build_alert(
    ctx: &DetectorContext,
    mint: &str,
    snapshot: &mintwatch_core_types::MintSnapshot,
    fire: &TriggerFire,
    mcap_sol: Option<f64>,
) -> Alert {
    let pipeline = &ctx.pipeline;
    let stats = &snapshot.stats_5m;

    let metadata = match pipeline.enrichment.token_metadata(mint).await {
        Ok(metadata) => metadata.unwrap_or_default(),
        Err(error) => {
            debug!(mint, error = %error, "token metadata lookup failed");
            Default::default()
        }
    };

    let buy_timestamps = pipeline.buy_timestamps(mint);
    let score = ctx.score.score(mint, stats, &buy_timestamps).await;

    let buyer_wallets: Vec<String> = stats
        .top_buyers
        .iter()
        .map(|(wallet, _)| wallet.clone())
        .collect();
    let clusters = pipeline.clusterer.clusters_for(&buyer_wallets);

    // Pump-launched mints encode the venue in the address suffix; use that
    // when no swap carried a venue hint yet.
    let venue = if mint.ends_with("pump") {
        Some("pump".to_string())
    } else {
        None
    };

    Alert {
        id: Uuid::new_v4(),
        mint: mint.to_string(),
        token_symbol: metadata.symbol,
        token_name: metadata.name,
        token_image: metadata.image,
        trigger_name: fire.rule_name.clone(),
        trigger_reason: fire.reason.clone(),
        venue,
        volume_sol_5m: stats.buy_volume_sol,
        buy_count_5m: stats.buy_count,
        sell_count_5m: stats.sell_count,
        unique_buyers_5m: stats.unique_buyers,
        buy_sell_ratio_5m: ratio_for_wire(stats.buy_sell_ratio),
        mcap_sol,
        avg_entry_mcap: pipeline.avg_entry_mcap(mint),
        cto_score: score.total,
        cto_components: score.clone(),
        top_buyers: stats.top_buyers.clone(),
        clusters,
        enrichment_degraded: pipeline.enrichment.is_degraded() || score.cluster_timed_out,
        created_at: Utc::now(),
    }
}

/// Replays delta-log records for a freshly HOT mint so SwapEvents skipped in
/// DEGRADED mode reach the sink.
pub async fn run_backfill_worker(
    pipeline: Arc<SwapPipeline>,
    mut backfill_rx: mpsc::Receiver<String>,
    horizon_minutes: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("backfill worker started");
    loop {
        let mint = tokio::select! {
            mint = backfill_rx.recv() => match mint {
                Some(mint) => mint,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let since = Utc::now() - ChronoDuration::minutes(horizon_minutes as i64);
        let records = match pipeline.delta_log.range(&mint, since).await {
            Ok(records) => records,
            Err(error) => {
                warn!(mint, error = %error, "backfill range read failed");
                continue;
            }
        };

        let mut persisted = 0usize;
        for record in &records {
            match pipeline.backfill_record(&mint, record).await {
                Ok(true) => persisted += 1,
                Ok(false) => {}
                Err(error) => {
                    debug!(mint, signature = %record.signature, error = %error, "backfill record failed");
                }
            }
        }
        pipeline
            .metrics
            .incr(&pipeline.metrics.backfills_completed);
        info!(mint, scanned = records.len(), persisted, "backfill complete");
    }
    info!("backfill worker stopped");
}

/// 1 s sampler feeding the backpressure controller with group lag and
/// buffer depth. An unreachable store reads as unbounded lag, which drives
/// the mode to CRITICAL until it recovers.
pub async fn run_backpressure_sampler(
    stream: DurableStream,
    controller: Arc<BackpressureController>,
    pipeline: Arc<SwapPipeline>,
    sample_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = time::interval(sample_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        // An unreachable store samples as unbounded lag: the pipeline keeps
        // acking under CRITICAL so the stream cannot grow without bound.
        let mut store_reachable = true;
        let lag = match stream.oldest_pending_age_seconds().await {
            Ok(lag) => lag,
            Err(error) => {
                warn!(error = %error, "lag sample failed");
                store_reachable = false;
                Some(f64::INFINITY)
            }
        };
        let buffer_len = match stream.length().await {
            Ok(length) => length,
            Err(error) => {
                warn!(error = %error, "buffer sample failed");
                store_reachable = false;
                usize::MAX
            }
        };

        controller.observe(lag, buffer_len);

        let metrics = &pipeline.metrics;
        if store_reachable {
            metrics.set(&metrics.stream_length, buffer_len as u64);
            metrics.set(
                &metrics.processing_lag_ms,
                lag.map(|seconds| (seconds * 1_000.0) as u64).unwrap_or(0),
            );
        }
        metrics.set(&metrics.mode_changes, controller.mode_changes());
    }
    info!("backpressure sampler stopped");
}

/// Periodic housekeeping: a stats line for operators and a defensive trim so
/// the durable stream stays near its configured cap even if XADD trimming
/// falls behind.
pub async fn run_maintenance_loop(
    stream: DurableStream,
    pipeline: Arc<SwapPipeline>,
    stream_maxlen: usize,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let metrics = &pipeline.metrics;
        info!(
            tx_processed = metrics.tx_processed.load(std::sync::atomic::Ordering::Relaxed),
            swaps_detected = metrics.swaps_detected.load(std::sync::atomic::Ordering::Relaxed),
            hot_tokens = metrics.hot_tokens.load(std::sync::atomic::Ordering::Relaxed),
            stream_length = metrics.stream_length.load(std::sync::atomic::Ordering::Relaxed),
            processing_lag_ms = metrics.processing_lag_ms.load(std::sync::atomic::Ordering::Relaxed),
            mode = pipeline.mode.load().as_str(),
            "pipeline stats"
        );

        if let Err(error) = stream.trim_to_maxlen(stream_maxlen).await {
            warn!(error = %error, "stream trim failed");
        }
    }
    info!("maintenance loop stopped");
}

/// Applies `cfg:reload` notifications. Each section re-fetches its own
/// payload; a payload that fails validation leaves the running config alone.
pub async fn run_reload_listener(
    config_channel: ConfigChannel,
    mut reload_rx: mpsc::Receiver<String>,
    evaluator: Arc<TriggerEvaluator>,
    controller: Arc<BackpressureController>,
    pipeline: Arc<SwapPipeline>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let section = tokio::select! {
            section = reload_rx.recv() => match section {
                Some(section) => section,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let payload = match config_channel.get_section(&section).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                warn!(section = %section, "reload notification without payload");
                continue;
            }
            Err(error) => {
                warn!(section = %section, error = %error, "reload fetch failed");
                continue;
            }
        };

        match section.as_str() {
            "thresholds" => {
                if evaluator.try_reload_from_json(&payload) {
                    info!(rules = evaluator.rule_count(), "trigger rules reloaded");
                }
            }
            "backpressure" => match parse_backpressure_payload(&payload) {
                Ok(thresholds) => {
                    controller.update_thresholds(thresholds);
                    info!("backpressure thresholds reloaded");
                }
                Err(error) => {
                    warn!(error = %error, "backpressure reload rejected");
                }
            },
            "detection" => match serde_json::from_str::<Value>(&payload) {
                Ok(value) => {
                    if let Some(floor) = value.get("min_swap_confidence").and_then(Value::as_f64) {
                        pipeline.set_min_confidence(floor);
                        info!(floor, "swap confidence floor reloaded");
                    }
                    if let Some(ttl) = value.get("hot_ttl_seconds").and_then(Value::as_u64) {
                        pipeline.state.set_hot_ttl_seconds(ttl);
                        info!(ttl, "hot ttl reloaded");
                    }
                }
                Err(error) => {
                    warn!(error = %error, "detection reload rejected");
                }
            },
            "alerts" => {
                info!("alert channel changes apply on restart");
            }
            other => {
                warn!(section = %other, "unknown reload section ignored");
            }
        }
    }
    info!("config reload listener stopped");
}

fn parse_backpressure_payload(payload: &str) -> Result<Thresholds> {
    let value: Value = serde_json::from_str(payload)?;
    let lag_warn_s = value
        .get("lag_warn_s")
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow::anyhow!("missing lag_warn_s"))?;
    let lag_crit_s = value
        .get("lag_crit_s")
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow::anyhow!("missing lag_crit_s"))?;
    let buf_warn = value
        .get("buf_warn")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("missing buf_warn"))? as usize;
    let buf_crit = value
        .get("buf_crit")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow::anyhow!("missing buf_crit"))? as usize;
    if lag_warn_s >= lag_crit_s || buf_warn >= buf_crit {
        return Err(anyhow::anyhow!("warn thresholds must sit below crit"));
    }
    Ok(Thresholds {
        lag_warn_s,
        lag_crit_s,
        buf_warn,
        buf_crit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_payload_parses_and_validates() {
        let thresholds = parse_backpressure_payload(
            r#"{"lag_warn_s": 5, "lag_crit_s": 30, "buf_warn": 50000, "buf_crit": 80000}"#,
        )
        .expect("valid payload");
        assert_eq!(thresholds.buf_crit, 80_000);

        assert!(parse_backpressure_payload(
            r#"{"lag_warn_s": 30, "lag_crit_s": 5, "buf_warn": 1, "buf_crit": 2}"#
        )
        .is_err());
        assert!(parse_backpressure_payload(r#"{"lag_warn_s": 5}"#).is_err());
    }
}
