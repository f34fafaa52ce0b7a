use anyhow::Result;
use mintwatch_parser::SeenMintCache;
use mintwatch_store::{decode_record, DedupFilter, DurableStream, StreamRecord};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::pipeline::SwapPipeline;

pub struct ConsumerSettings {
    pub batch_size: usize,
    pub block_ms: u64,
    pub claim_min_idle_ms: u64,
    pub seen_mint_cache_size: usize,
}

pub fn consumer_name(index: usize) -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("parser-{host}-{}-{index}", std::process::id())
}

/// One consumer task. On startup it sweeps idle pending records left by dead
/// consumers through the same pipeline as fresh reads, then loops on
/// `read_group` until shutdown. Every record read is eventually acked or left
/// pending for the next claim sweep.
pub async fn run_consumer(
    name: String,
    stream: DurableStream,
    dedup: DedupFilter,
    pipeline: Arc<SwapPipeline>,
    settings: ConsumerSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut seen = SeenMintCache::new(settings.seen_mint_cache_size);

    if let Err(error) = claim_sweep(&name, &stream, &dedup, &pipeline, &settings, &mut seen).await {
        warn!(consumer = %name, error = %error, "startup claim sweep failed");
    }

    info!(consumer = %name, "consumer loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = tokio::select! {
            result = stream.read_group(&name, settings.batch_size, settings.block_ms) => result,
            _ = shutdown.changed() => continue,
        };

        let records = match batch {
            Ok(records) => records,
            Err(error) => {
                warn!(consumer = %name, error = %error, "stream read failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        if records.is_empty() {
            continue;
        }

        // The current batch always finishes, even under shutdown; only then
        // does the loop observe the flag and exit.
        let ack_ids = process_batch(&name, &dedup, &pipeline, &mut seen, records).await;
        ack_with_logging(&name, &stream, &pipeline, &ack_ids).await;
    }
    info!(consumer = %name, "consumer loop stopped");
}

async fn claim_sweep(
    name: &str,
    stream: &DurableStream,
    dedup: &DedupFilter,
    pipeline: &Arc<SwapPipeline>,
    settings: &ConsumerSettings,
    seen: &mut SeenMintCache,
) -> Result<()> {
    let mut cursor = "0-0".to_string();
    let mut recovered = 0usize;
    loop {
        let (records, next_cursor) = stream
            .claim_idle(name, settings.claim_min_idle_ms, &cursor, settings.batch_size)
            .await?;
        if records.is_empty() {
            break;
        }
        recovered += records.len();
        for _ in 0..records.len() {
            pipeline.metrics.incr(&pipeline.metrics.records_claimed);
        }

        // Claimed records run the normal pipeline and only ack on completion;
        // acking unprocessed claims would silently lose them.
        let ack_ids = process_batch(name, dedup, pipeline, seen, records).await;
        ack_with_logging(name, stream, pipeline, &ack_ids).await;

        if next_cursor == "0-0" {
            break;
        }
        cursor = next_cursor;
    }
    if recovered > 0 {
        info!(consumer = %name, recovered, "claimed idle records from prior consumers");
    }
    Ok(())
}

/// Runs each record through dedup and the pipeline. Malformed records and
/// completed records ack; a processing failure is recorded (metric + log)
/// before the record acks, so nothing is dropped silently and the stream
/// still drains.
async fn process_batch(
    name: &str,
    dedup: &DedupFilter,
    pipeline: &Arc<SwapPipeline>,
    seen: &mut SeenMintCache,
    records: Vec<StreamRecord>,
) -> Vec<String> {
    let mut ack_ids = Vec::with_capacity(records.len());

    for record in records {
        let tx = match decode_record(&record.payload) {
            Ok(tx) => tx,
            Err(error) => {
                pipeline.metrics.incr(&pipeline.metrics.parse_failures);
                warn!(
                    consumer = %name,
                    record_id = %record.id,
                    payload_hash = %opaque_hash(&record.payload),
                    error = %error,
                    "malformed record acked without processing"
                );
                ack_ids.push(record.id);
                continue;
            }
        };

        let fresh = match dedup.first_occurrence(&tx.signature, &record.id).await {
            Ok(fresh) => fresh,
            Err(error) => {
                // Dedup unavailable: leave the record pending so the next
                // claim sweep retries it instead of double-counting now.
                warn!(consumer = %name, error = %error, "dedup check failed, leaving record pending");
                continue;
            }
        };
        if !fresh {
            pipeline.metrics.incr(&pipeline.metrics.duplicates_skipped);
            debug!(consumer = %name, signature = %tx.signature, "duplicate signature skipped");
            ack_ids.push(record.id);
            continue;
        }

        match pipeline.process_record(&tx, seen).await {
            Ok(_) => {
                pipeline.metrics.incr(&pipeline.metrics.tx_processed);
            }
            Err(error) => {
                pipeline.metrics.incr(&pipeline.metrics.parse_failures);
                error!(
                    consumer = %name,
                    signature = %tx.signature,
                    error = %error,
                    "record processing failed"
                );
            }
        }
        ack_ids.push(record.id);
    }

    ack_ids
}

async fn ack_with_logging(
    name: &str,
    stream: &DurableStream,
    pipeline: &Arc<SwapPipeline>,
    ack_ids: &[String],
) {
    if ack_ids.is_empty() {
        return;
    }
    match stream.ack(ack_ids).await {
        Ok(()) => {
            for _ in ack_ids {
                pipeline.metrics.incr(&pipeline.metrics.records_acked);
            }
        }
        Err(error) => {
            // Unacked records stay pending and come back via claim_idle.
            warn!(consumer = %name, count = ack_ids.len(), error = %error, "ack failed, records stay pending");
        }
    }
}

fn opaque_hash(payload: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_names_are_disjoint_per_index() {
        let first = consumer_name(0);
        let second = consumer_name(1);
        assert_ne!(first, second);
        assert!(first.starts_with("parser-"));
        assert!(first.ends_with("-0"));
    }

    #[test]
    fn opaque_hash_is_stable_and_hex() {
        let first = opaque_hash(b"payload");
        let second = opaque_hash(b"payload");
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
