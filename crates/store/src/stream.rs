use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use mintwatch_config::{CONSUMER_GROUP, TX_STREAM_KEY};
use mintwatch_core_types::RawTransaction;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, info};

use crate::RedisStore;

#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: String,
    pub payload: Vec<u8>,
}

pub fn encode_record(tx: &RawTransaction) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(tx).context("failed to encode transaction record")
}

pub fn decode_record(payload: &[u8]) -> Result<RawTransaction> {
    rmp_serde::from_slice(payload).context("failed to decode transaction record")
}

/// Append-only transaction buffer with consumer groups over Redis Streams.
/// At-least-once: records stay pending per consumer until acked, and idle
/// pending records transfer ownership through `claim_idle`.
#[derive(Clone)]
pub struct DurableStream {
    conn: ConnectionManager,
    maxlen: usize,
}

impl DurableStream {
    pub fn new(store: &RedisStore, maxlen: usize) -> Self {
        Self {
            conn: store.connection(),
            maxlen,
        }
    }

    /// Creates the consumer group if missing. An existing group is fine;
    /// anything else is a startup failure.
    pub async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<String> = conn
            .xgroup_create_mkstream(TX_STREAM_KEY, CONSUMER_GROUP, "0")
            .await;
        match created {
            Ok(_) => {
                info!(group = CONSUMER_GROUP, "consumer group created");
                Ok(())
            }
            Err(error) if error.to_string().contains("BUSYGROUP") => {
                debug!(group = CONSUMER_GROUP, "consumer group already exists");
                Ok(())
            }
            Err(error) => Err(error).context("failed to create consumer group"),
        }
    }

    pub async fn append(&self, payload: &[u8]) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: String = redis::cmd("XADD")
            .arg(TX_STREAM_KEY)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.maxlen)
            .arg("*")
            .arg("data")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .context("failed to append to durable stream")?;
        Ok(id)
    }

    pub async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamRecord>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(count)
            .block(block_ms as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[TX_STREAM_KEY], &[">"], &options)
            .await
            .context("failed reading from durable stream")?;
        Ok(flatten_reply(reply))
    }

    pub async fn ack(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(TX_STREAM_KEY, CONSUMER_GROUP, ids)
            .await
            .context("failed to ack stream records")?;
        Ok(())
    }

    /// Transfers ownership of records left pending longer than `min_idle_ms`
    /// to `consumer`. Returns the claimed records and the cursor for the next
    /// sweep iteration.
    pub async fn claim_idle(
        &self,
        consumer: &str,
        min_idle_ms: u64,
        start_id: &str,
        count: usize,
    ) -> Result<(Vec<StreamRecord>, String)> {
        let mut conn = self.conn.clone();
        let options = StreamAutoClaimOptions::default().count(count);
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                TX_STREAM_KEY,
                CONSUMER_GROUP,
                consumer,
                min_idle_ms as usize,
                start_id,
                options,
            )
            .await
            .context("failed to claim idle stream records")?;
        let records = reply
            .claimed
            .into_iter()
            .filter_map(stream_id_to_record)
            .collect();
        Ok((records, reply.next_stream_id))
    }

    pub async fn length(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .xlen(TX_STREAM_KEY)
            .await
            .context("failed to read stream length")?;
        Ok(len)
    }

    pub async fn trim_to_maxlen(&self, maxlen: usize) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XTRIM")
            .arg(TX_STREAM_KEY)
            .arg("MAXLEN")
            .arg("~")
            .arg(maxlen)
            .query_async(&mut conn)
            .await
            .context("failed to trim durable stream")?;
        Ok(())
    }

    /// Age of the oldest unacked record across the whole group, derived from
    /// the millisecond prefix of its stream id. Feeds the backpressure lag
    /// signal.
    pub async fn oldest_pending_age_seconds(&self) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn
            .xpending(TX_STREAM_KEY, CONSUMER_GROUP)
            .await
            .context("failed to read pending summary")?;
        let StreamPendingReply::Data(data) = reply else {
            return Ok(None);
        };
        let ms = parse_stream_id_millis(&data.start_id)?;
        let age_ms = (Utc::now().timestamp_millis() - ms).max(0);
        Ok(Some(age_ms as f64 / 1_000.0))
    }
}

fn flatten_reply(reply: StreamReadReply) -> Vec<StreamRecord> {
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids.into_iter())
        .filter_map(stream_id_to_record)
        .collect()
}

fn stream_id_to_record(id: StreamId) -> Option<StreamRecord> {
    let payload: Vec<u8> = id.get("data")?;
    Some(StreamRecord { id: id.id, payload })
}

fn parse_stream_id_millis(id: &str) -> Result<i64> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .ok_or_else(|| anyhow!("malformed stream id: {id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn record_codec_round_trips() {
        let tx = RawTransaction {
            signature: "sig-rt".to_string(),
            slot: 42,
            ingest_time: Utc::now(),
            block_time: Some(1_700_000_000),
            fee: 5_000,
            account_keys: vec!["walletA".to_string()],
            pre_token_balances: vec![],
            post_token_balances: vec![],
            pre_lamports: vec![10],
            post_lamports: vec![5],
            program_ids_touched: vec!["prog".to_string()],
        };
        let encoded = encode_record(&tx).expect("encode");
        let decoded = decode_record(&encoded).expect("decode");
        assert_eq!(decoded.signature, tx.signature);
        assert_eq!(decoded.slot, tx.slot);
        assert_eq!(decoded.pre_lamports, tx.pre_lamports);
    }

    #[test]
    fn stream_id_millis_parse() {
        assert_eq!(
            parse_stream_id_millis("1700000000000-0").expect("parses"),
            1_700_000_000_000
        );
        assert!(parse_stream_id_millis("bogus").is_err());
    }
}
