use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

use crate::RedisStore;

/// Signature dedup over an atomic SET NX EX. First occurrence returns true;
/// duplicates within the TTL return false and are skipped downstream.
#[derive(Clone)]
pub struct DedupFilter {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl DedupFilter {
    pub fn new(store: &RedisStore, ttl_seconds: u64) -> Self {
        Self {
            conn: store.connection(),
            ttl_seconds,
        }
    }

    /// Empty or sentinel signatures fall back to the stream record id so
    /// unrelated records never collapse onto one dedup key.
    pub async fn first_occurrence(&self, signature: &str, stream_id: &str) -> Result<bool> {
        let key = if signature.trim().is_empty() {
            format!("sig:id:{stream_id}")
        } else {
            format!("sig:{signature}")
        };
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await
            .context("dedup check failed")?;
        Ok(set.is_some())
    }
}
