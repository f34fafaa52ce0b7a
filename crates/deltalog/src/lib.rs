mod segment;

pub use self::segment::{read_segment_frames, segment_start_time, CODEC_MSGPACK_ZSTD};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mintwatch_config::DeltaLogConfig;
use mintwatch_core_types::TxDeltaRecord;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use self::segment::SegmentWriter;

const CLEANUP_INTERVAL_SECONDS: u64 = 60;

enum Command {
    Append(TxDeltaRecord),
    Flush(oneshot::Sender<()>),
}

/// Append handle for the short-retention delta log. Appends go through a
/// bounded queue; a full queue drops the record with a warning rather than
/// stalling the consumer.
#[derive(Clone)]
pub struct DeltaLog {
    tx: mpsc::Sender<Command>,
    data_dir: PathBuf,
    retention: Duration,
}

pub struct DeltaLogTask {
    pub handle: JoinHandle<()>,
}

impl DeltaLog {
    pub fn start(config: &DeltaLogConfig) -> Result<(Self, DeltaLogTask)> {
        let data_dir = PathBuf::from(&config.data_dir);
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create delta log dir: {}", data_dir.display()))?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(64));
        let writer_config = WriterConfig {
            data_dir: data_dir.clone(),
            rotate_max_bytes: config.rotate_max_bytes.max(1024 * 1024),
            rotate_max_seconds: config.rotate_max_seconds.max(60),
            retention: Duration::from_secs(config.retention_minutes.max(1) * 60),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(100)),
        };
        let handle = tokio::spawn(writer_loop(writer_config, rx));
        info!(data_dir = %data_dir.display(), "delta log started");

        Ok((
            Self {
                tx,
                data_dir,
                retention: Duration::from_secs(config.retention_minutes.max(1) * 60),
            },
            DeltaLogTask { handle },
        ))
    }

    pub fn append(&self, record: TxDeltaRecord) {
        if let Err(error) = self.tx.try_send(Command::Append(record)) {
            warn!(error = %error, "delta log queue full, dropping record");
        }
    }

    /// Forces all queued records to disk and waits for the writer to confirm.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .await
            .context("delta log writer is gone")?;
        ack_rx.await.context("delta log flush ack dropped")?;
        Ok(())
    }

    /// Records for `mint` no older than `since`, read off the blocking pool.
    pub async fn range(&self, mint: &str, since: DateTime<Utc>) -> Result<Vec<TxDeltaRecord>> {
        let data_dir = self.data_dir.clone();
        let retention = self.retention;
        let mint = mint.to_string();
        tokio::task::spawn_blocking(move || read_range(&data_dir, &mint, since, retention))
            .await
            .context("delta log range read task failed")?
    }
}

struct WriterConfig {
    data_dir: PathBuf,
    rotate_max_bytes: u64,
    rotate_max_seconds: u64,
    retention: Duration,
    flush_interval: Duration,
}

async fn writer_loop(config: WriterConfig, mut rx: mpsc::Receiver<Command>) {
    let mut writer: Option<SegmentWriter> = None;
    let mut flush_tick = time::interval(config.flush_interval);
    flush_tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
    let mut cleanup_tick = time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECONDS));
    cleanup_tick.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(Command::Append(record)) => {
                        if let Err(error) = append_record(&config, &mut writer, &record) {
                            error!(error = %error, "delta log append failed");
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        if let Some(writer) = writer.as_mut() {
                            if let Err(error) = writer.flush() {
                                error!(error = %error, "delta log flush failed");
                            }
                        }
                        let _ = ack.send(());
                    }
                    None => break,
                }
            }
            _ = flush_tick.tick() => {
                if let Some(writer) = writer.as_mut() {
                    if let Err(error) = writer.flush() {
                        error!(error = %error, "delta log periodic flush failed");
                    }
                }
            }
            _ = cleanup_tick.tick() => {
                let open_segment = writer.as_ref().map(|writer| writer.path().to_path_buf());
                if let Err(error) = cleanup_expired(&config.data_dir, config.retention, open_segment.as_deref()) {
                    error!(error = %error, "delta log cleanup failed");
                }
            }
        }
    }

    // Channel closed: drain whatever is buffered and leave segments flushed.
    if let Some(writer) = writer.as_mut() {
        if let Err(error) = writer.flush() {
            error!(error = %error, "delta log final flush failed");
        }
    }
    info!("delta log writer stopped");
}

fn append_record(
    config: &WriterConfig,
    writer: &mut Option<SegmentWriter>,
    record: &TxDeltaRecord,
) -> Result<()> {
    let now = Utc::now();
    let needs_rotation = match writer.as_ref() {
        None => true,
        Some(current) => {
            current.bytes_written() >= config.rotate_max_bytes
                || now.signed_duration_since(current.opened_at()).num_seconds()
                    >= config.rotate_max_seconds as i64
        }
    };
    if needs_rotation {
        if let Some(mut old) = writer.take() {
            old.flush()?;
        }
        let fresh = SegmentWriter::open(&config.data_dir, now)?;
        debug!(segment = %fresh.path().display(), "delta log segment rotated");
        *writer = Some(fresh);
    }
    writer
        .as_mut()
        .expect("segment writer opened above")
        .append(record)
}

fn cleanup_expired(
    data_dir: &Path,
    retention: Duration,
    open_segment: Option<&Path>,
) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::seconds(retention.as_secs() as i64);
    let mut deleted = 0;
    for entry in std::fs::read_dir(data_dir)
        .with_context(|| format!("failed listing delta log dir: {}", data_dir.display()))?
    {
        let path = entry?.path();
        let Some(start) = segment_start_time(&path) else {
            continue;
        };
        // The currently open segment is never a deletion candidate.
        if open_segment.is_some_and(|open| open == path) {
            continue;
        }
        if start < cutoff {
            if let Err(error) = std::fs::remove_file(&path) {
                warn!(segment = %path.display(), error = %error, "failed to delete expired segment");
            } else {
                deleted += 1;
            }
        }
    }
    if deleted > 0 {
        info!(deleted, "expired delta log segments removed");
    }
    Ok(deleted)
}

fn read_range(
    data_dir: &Path,
    mint: &str,
    since: DateTime<Utc>,
    retention: Duration,
) -> Result<Vec<TxDeltaRecord>> {
    let retention_floor = Utc::now() - chrono::Duration::seconds(retention.as_secs() as i64);
    let earliest = since.min(retention_floor);

    let mut segments: Vec<PathBuf> = std::fs::read_dir(data_dir)
        .with_context(|| format!("failed listing delta log dir: {}", data_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| segment_start_time(path).is_some())
        .collect();
    segments.sort();

    let mut out = Vec::new();
    for path in segments {
        let Some(start) = segment_start_time(&path) else {
            continue;
        };
        // A segment that started before `since` can still contain in-range
        // frames, so only skip those that ended before the range opens.
        if start + chrono::Duration::hours(1) < earliest {
            continue;
        }
        let frames = match read_segment_frames(&path) {
            Ok(frames) => frames,
            Err(error) => {
                warn!(segment = %path.display(), error = %error, "skipping unreadable segment");
                continue;
            }
        };
        for record in frames {
            if record.ts_unix >= since.timestamp() && record.mints_touched.iter().any(|m| m == mint)
            {
                out.push(record);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_dir() -> PathBuf {
        let nonce = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "mintwatch-deltalog-{}-{nonce}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create test dir");
        dir
    }

    fn record(signature: &str, mint: &str, ts_unix: i64) -> TxDeltaRecord {
        TxDeltaRecord {
            signature: signature.to_string(),
            slot: 10,
            ts_unix,
            fee_payer: "walletA".to_string(),
            token_deltas: vec![("walletA".to_string(), mint.to_string(), 100.0)],
            native_deltas: vec![("walletA".to_string(), -0.5)],
            mints_touched: vec![mint.to_string()],
            program_ids: vec!["prog".to_string()],
        }
    }

    fn config_for(dir: &Path) -> DeltaLogConfig {
        DeltaLogConfig {
            data_dir: dir.to_string_lossy().to_string(),
            retention_minutes: 60,
            rotate_max_bytes: 64 * 1024 * 1024,
            rotate_max_seconds: 3_600,
            queue_capacity: 256,
            flush_interval_ms: 100,
        }
    }

    #[tokio::test]
    async fn written_record_is_visible_in_range_read() {
        let dir = test_dir();
        let (log, task) = DeltaLog::start(&config_for(&dir)).expect("start");

        let now = Utc::now();
        log.append(record("sig-1", "MintM", now.timestamp()));
        log.append(record("sig-2", "OtherMint", now.timestamp()));
        log.flush().await.expect("flush");

        let records = log
            .range("MintM", now - chrono::Duration::minutes(5))
            .await
            .expect("range read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].signature, "sig-1");

        drop(log);
        let _ = task.handle.await;
    }

    #[tokio::test]
    async fn range_excludes_records_before_since() {
        let dir = test_dir();
        let (log, task) = DeltaLog::start(&config_for(&dir)).expect("start");

        let now = Utc::now();
        log.append(record("sig-old", "MintM", now.timestamp() - 7_200));
        log.append(record("sig-new", "MintM", now.timestamp()));
        log.flush().await.expect("flush");

        let records = log
            .range("MintM", now - chrono::Duration::minutes(30))
            .await
            .expect("range read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].signature, "sig-new");

        drop(log);
        let _ = task.handle.await;
    }

    #[test]
    fn cleanup_never_touches_the_open_segment() {
        let dir = test_dir();
        let old_name = dir.join("delta-20200101-000000.log");
        std::fs::write(&old_name, b"stale").expect("write stale segment");

        let open = dir.join("delta-20200101-010000.log");
        std::fs::write(&open, b"open").expect("write open segment");

        let deleted =
            cleanup_expired(&dir, Duration::from_secs(3_600), Some(open.as_path())).expect("cleanup");
        assert_eq!(deleted, 1);
        assert!(open.exists(), "open segment must survive cleanup");
        assert!(!old_name.exists());
    }
}
