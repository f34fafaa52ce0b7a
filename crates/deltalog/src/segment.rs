use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use mintwatch_core_types::TxDeltaRecord;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const CODEC_MSGPACK_ZSTD: u8 = 1;

const SEGMENT_PREFIX: &str = "delta-";
const SEGMENT_SUFFIX: &str = ".log";
const SEGMENT_TIME_FORMAT: &str = "%Y%m%d-%H%M%S";
/// Upper bound on a single decompressed frame; anything larger means a
/// corrupt length prefix.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;
const ZSTD_LEVEL: i32 = 1;

/// One open segment file. Frames are `{u32 BE payload length, u8 codec,
/// payload}` with codec 1 = msgpack compressed with zstd.
pub(crate) struct SegmentWriter {
    path: PathBuf,
    file: BufWriter<File>,
    opened_at: DateTime<Utc>,
    bytes_written: u64,
}

impl SegmentWriter {
    pub(crate) fn open(data_dir: &Path, now: DateTime<Utc>) -> Result<Self> {
        let name = format!(
            "{SEGMENT_PREFIX}{}{SEGMENT_SUFFIX}",
            now.format(SEGMENT_TIME_FORMAT)
        );
        let path = data_dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open segment: {}", path.display()))?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            opened_at: now,
            bytes_written: 0,
        })
    }

    pub(crate) fn append(&mut self, record: &TxDeltaRecord) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(record).context("failed to encode delta record")?;
        let payload =
            zstd::stream::encode_all(encoded.as_slice(), ZSTD_LEVEL).context("zstd encode failed")?;

        let length = payload.len() as u32;
        self.file
            .write_all(&length.to_be_bytes())
            .context("failed writing frame length")?;
        self.file
            .write_all(&[CODEC_MSGPACK_ZSTD])
            .context("failed writing frame codec")?;
        self.file
            .write_all(&payload)
            .context("failed writing frame payload")?;
        self.bytes_written += 4 + 1 + payload.len() as u64;
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.flush().context("failed flushing segment")
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

/// Parses the segment start time out of a `delta-YYYYMMDD-HHMMSS.log` name.
/// Non-segment files yield `None` and are ignored by cleanup and reads.
pub fn segment_start_time(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let stamp = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, SEGMENT_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Reads every decodable frame from a segment. Stops at truncation (a crash
/// mid-write leaves a short tail) and skips frames with unknown codecs.
pub fn read_segment_frames(path: &Path) -> Result<Vec<TxDeltaRecord>> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open segment: {}", path.display()))?;
    let mut records = Vec::new();

    loop {
        let mut length_buf = [0u8; 4];
        match file.read_exact(&mut length_buf) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(error) => return Err(error).context("failed reading frame length"),
        }
        let length = u32::from_be_bytes(length_buf);
        if length == 0 || length > MAX_FRAME_BYTES {
            return Err(anyhow!("corrupt frame length {length} in {}", path.display()));
        }

        let mut codec_buf = [0u8; 1];
        match file.read_exact(&mut codec_buf) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(error) => return Err(error).context("failed reading frame codec"),
        }

        let mut payload = vec![0u8; length as usize];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(error) => return Err(error).context("failed reading frame payload"),
        }

        if codec_buf[0] != CODEC_MSGPACK_ZSTD {
            continue;
        }
        let decompressed =
            zstd::stream::decode_all(payload.as_slice()).context("zstd decode failed")?;
        let record: TxDeltaRecord =
            rmp_serde::from_slice(&decompressed).context("failed to decode delta record")?;
        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn test_dir() -> PathBuf {
        let nonce = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "mintwatch-segment-{}-{nonce}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create test dir");
        dir
    }

    fn record(signature: &str) -> TxDeltaRecord {
        TxDeltaRecord {
            signature: signature.to_string(),
            slot: 7,
            ts_unix: 1_700_000_000,
            fee_payer: "walletA".to_string(),
            token_deltas: vec![("walletA".to_string(), "MintM".to_string(), 5.0)],
            native_deltas: vec![("walletA".to_string(), -0.1)],
            mints_touched: vec!["MintM".to_string()],
            program_ids: vec![],
        }
    }

    #[test]
    fn frames_round_trip_through_a_segment() {
        let dir = test_dir();
        let now = Utc::now();
        let mut writer = SegmentWriter::open(&dir, now).expect("open");
        writer.append(&record("sig-a")).expect("append");
        writer.append(&record("sig-b")).expect("append");
        writer.flush().expect("flush");

        let frames = read_segment_frames(writer.path()).expect("read");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].signature, "sig-a");
        assert_eq!(frames[1].signature, "sig-b");
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let dir = test_dir();
        let mut writer = SegmentWriter::open(&dir, Utc::now()).expect("open");
        writer.append(&record("sig-whole")).expect("append");
        writer.flush().expect("flush");
        let path = writer.path().to_path_buf();
        drop(writer);

        // Simulate a crash mid-frame: a dangling length prefix.
        let mut file = OpenOptions::new().append(true).open(&path).expect("reopen");
        file.write_all(&100u32.to_be_bytes()).expect("write tail");
        file.write_all(&[CODEC_MSGPACK_ZSTD]).expect("write codec");
        file.write_all(&[0u8; 10]).expect("short payload");
        drop(file);

        let frames = read_segment_frames(&path).expect("read tolerates truncation");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].signature, "sig-whole");
    }

    #[test]
    fn segment_names_encode_their_start_time() {
        let path = PathBuf::from("/data/delta-20260314-101530.log");
        let start = segment_start_time(&path).expect("parses");
        assert_eq!(start.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-03-14 10:15:30");

        assert!(segment_start_time(Path::new("/data/other.txt")).is_none());
    }
}
