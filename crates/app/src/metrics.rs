use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use mintwatch_detection::ModeCell;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Default)]
pub struct Metrics {
    pub records_relayed: AtomicU64,
    pub tx_processed: AtomicU64,
    pub parse_failures: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub swaps_detected: AtomicU64,
    pub swaps_persisted: AtomicU64,
    pub mint_touches: AtomicU64,
    pub sink_failures: AtomicU64,
    pub triggers_fired: AtomicU64,
    pub alerts_sent: AtomicU64,
    pub alerts_suppressed: AtomicU64,
    pub backfills_completed: AtomicU64,
    pub records_claimed: AtomicU64,
    pub records_acked: AtomicU64,
    pub mode_changes: AtomicU64,
    pub stream_length: AtomicU64,
    pub processing_lag_ms: AtomicU64,
    pub hot_tokens: AtomicU64,
    pub active_mints: AtomicU64,
}

impl Metrics {
    pub fn incr(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set(&self, gauge: &AtomicU64, value: u64) {
        gauge.store(value, Ordering::Relaxed);
    }
}

struct WebState {
    metrics: Arc<Metrics>,
    mode: Arc<ModeCell>,
    started_at: DateTime<Utc>,
}

/// Serves `/metrics` (Prometheus text) and `/healthz` on the configured
/// bind address.
pub fn spawn_metrics_server(
    bind: String,
    metrics: Arc<Metrics>,
    mode: Arc<ModeCell>,
) -> JoinHandle<()> {
    let state = Arc::new(WebState {
        metrics,
        mode,
        started_at: Utc::now(),
    });
    tokio::spawn(async move {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(health_handler))
            .with_state(state);
        let listener = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(error) => {
                tracing::error!(bind = %bind, error = %error, "failed to bind metrics server");
                return;
            }
        };
        info!(bind = %bind, "metrics server listening");
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(error = %error, "metrics server stopped");
        }
    })
}

async fn metrics_handler(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    let m = &state.metrics;
    let mode = state.mode.load();
    let lines = [
        format!(
            "mintwatch_records_relayed_total {}",
            m.records_relayed.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_tx_processed_total {}",
            m.tx_processed.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_parse_failures_total {}",
            m.parse_failures.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_duplicates_skipped_total {}",
            m.duplicates_skipped.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_swaps_detected_total {}",
            m.swaps_detected.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_swaps_persisted_total {}",
            m.swaps_persisted.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_mint_touches_total {}",
            m.mint_touches.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_sink_failures_total {}",
            m.sink_failures.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_triggers_fired_total {}",
            m.triggers_fired.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_alerts_sent_total {}",
            m.alerts_sent.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_alerts_suppressed_total {}",
            m.alerts_suppressed.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_backfills_completed_total {}",
            m.backfills_completed.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_records_claimed_total {}",
            m.records_claimed.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_records_acked_total {}",
            m.records_acked.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_mode_changes_total {}",
            m.mode_changes.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_stream_length {}",
            m.stream_length.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_processing_lag_ms {}",
            m.processing_lag_ms.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_hot_tokens {}",
            m.hot_tokens.load(Ordering::Relaxed)
        ),
        format!(
            "mintwatch_active_mints {}",
            m.active_mints.load(Ordering::Relaxed)
        ),
        format!("mintwatch_mode{{mode=\"{}\"}} 1", mode.as_str()),
    ];
    (StatusCode::OK, lines.join("\n") + "\n")
}

async fn health_handler(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "status": "ok",
        "mode": state.mode.load().as_str(),
        "uptime_seconds": uptime_seconds,
        "stream_length": state.metrics.stream_length.load(Ordering::Relaxed),
        "processing_lag_ms": state.metrics.processing_lag_ms.load(Ordering::Relaxed),
        "hot_tokens": state.metrics.hot_tokens.load(Ordering::Relaxed),
    }))
}
