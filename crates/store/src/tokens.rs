use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::RedisStore;

const PROGRAM_TRACK_TTL_SECONDS: u64 = 7 * 24 * 3_600;
const MCAP_TTL_SECONDS: u64 = 3_600;

/// Shared token-level keys: HOT markers consumed by other process roles,
/// cached mcap/price from recent swaps, and unknown-program discovery.
#[derive(Clone)]
pub struct TokenKeys {
    conn: ConnectionManager,
}

impl TokenKeys {
    pub fn new(store: &RedisStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    pub async fn mark_hot(&self, mint: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(format!("hot:{mint}"), 1u8, ttl_seconds)
            .await
            .context("failed to mark token hot")?;
        Ok(())
    }

    pub async fn clear_hot(&self, mint: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(format!("hot:{mint}"))
            .await
            .context("failed to clear hot marker")?;
        Ok(())
    }

    pub async fn is_hot(&self, mint: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(format!("hot:{mint}"))
            .await
            .context("failed to check hot marker")?;
        Ok(exists)
    }

    pub async fn set_mcap(&self, mint: &str, mcap_sol: f64, price_sol: f64) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.cmd("SET")
            .arg(format!("mcap:{mint}"))
            .arg(mcap_sol)
            .arg("EX")
            .arg(MCAP_TTL_SECONDS)
            .ignore();
        pipe.cmd("SET")
            .arg(format!("price:{mint}"))
            .arg(price_sol)
            .arg("EX")
            .arg(MCAP_TTL_SECONDS)
            .ignore();
        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("failed to cache token mcap")?;
        Ok(())
    }

    pub async fn get_mcap(&self, mint: &str) -> Result<Option<(f64, Option<f64>)>> {
        let mut conn = self.conn.clone();
        let (mcap, price): (Option<f64>, Option<f64>) = redis::pipe()
            .cmd("GET")
            .arg(format!("mcap:{mint}"))
            .cmd("GET")
            .arg(format!("price:{mint}"))
            .query_async(&mut conn)
            .await
            .context("failed to read cached token mcap")?;
        Ok(mcap.map(|value| (value, price)))
    }

    /// Records an unrecognized program occurrence: running count, first slot
    /// seen, and the known venues it co-occurred with.
    pub async fn track_unknown_program(
        &self,
        program_id: &str,
        slot: u64,
        cooccurs_with: &[String],
    ) -> Result<u64> {
        let count_key = format!("prog:count:{program_id}");
        let first_key = format!("prog:first:{program_id}");
        let cooccur_key = format!("prog:cooccurs:{program_id}");

        let mut pipe = redis::pipe();
        pipe.cmd("INCR").arg(&count_key);
        pipe.cmd("SETNX").arg(&first_key).arg(slot).ignore();
        for known in cooccurs_with {
            pipe.cmd("SADD").arg(&cooccur_key).arg(known).ignore();
        }
        pipe.cmd("EXPIRE")
            .arg(&count_key)
            .arg(PROGRAM_TRACK_TTL_SECONDS)
            .ignore();
        pipe.cmd("EXPIRE")
            .arg(&first_key)
            .arg(PROGRAM_TRACK_TTL_SECONDS)
            .ignore();
        pipe.cmd("EXPIRE")
            .arg(&cooccur_key)
            .arg(PROGRAM_TRACK_TTL_SECONDS)
            .ignore();

        let mut conn = self.conn.clone();
        let (count,): (u64,) = pipe
            .query_async(&mut conn)
            .await
            .context("failed to track unknown program")?;
        Ok(count)
    }
}
