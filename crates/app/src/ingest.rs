use mintwatch_store::{encode_record, DurableStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::source::TxSource;

const APPEND_MAX_RETRIES: usize = 3;
const APPEND_RETRY_BACKOFF_MS: [u64; APPEND_MAX_RETRIES] = [100, 300, 700];

/// Ingest role: relay the upstream subscription into the durable stream.
/// Reconnects live inside the source; this loop only encodes and appends.
pub async fn run_ingest(
    mut source: TxSource,
    stream: DurableStream,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("ingest relay started");
    loop {
        let next = tokio::select! {
            next = source.next_transaction() => next,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let tx = match next {
            Ok(Some(tx)) => tx,
            Ok(None) => continue,
            Err(error) => {
                warn!(error = %error, "source error, continuing");
                time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let payload = match encode_record(&tx) {
            Ok(payload) => payload,
            Err(error) => {
                error!(signature = %tx.signature, error = %error, "failed encoding record");
                continue;
            }
        };

        let mut appended = false;
        for attempt in 0..=APPEND_MAX_RETRIES {
            match stream.append(&payload).await {
                Ok(_) => {
                    appended = true;
                    break;
                }
                Err(error) => {
                    if attempt < APPEND_MAX_RETRIES {
                        let backoff_ms = APPEND_RETRY_BACKOFF_MS[attempt];
                        warn!(
                            signature = %tx.signature,
                            attempt = attempt + 1,
                            backoff_ms,
                            error = %error,
                            "stream append failed, retrying"
                        );
                        time::sleep(Duration::from_millis(backoff_ms)).await;
                    } else {
                        error!(
                            signature = %tx.signature,
                            error = %error,
                            "stream append failed after retries, dropping record"
                        );
                    }
                }
            }
        }
        if appended {
            metrics.incr(&metrics.records_relayed);
        }
    }
    info!("ingest relay stopped");
}
