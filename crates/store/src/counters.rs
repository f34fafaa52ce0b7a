use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mintwatch_core_types::{MintSnapshot, SwapSide, WindowStats};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::RedisStore;

const WALLET_FIRST_SEEN_TTL_SECONDS: u64 = 7 * 24 * 3_600;
/// How many wallets from the heavy-hitter set are inspected for the
/// new-wallet fraction.
const NEW_WALLET_SCAN_LIMIT: isize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    FiveMin,
    OneHour,
}

impl Window {
    pub const ALL: [Window; 2] = [Window::FiveMin, Window::OneHour];

    pub fn label(&self) -> &'static str {
        match self {
            Window::FiveMin => "5m",
            Window::OneHour => "1h",
        }
    }

    pub fn bucket_seconds(&self) -> i64 {
        match self {
            Window::FiveMin => 10,
            Window::OneHour => 60,
        }
    }

    pub fn bucket_count(&self) -> i64 {
        match self {
            Window::FiveMin => 30,
            Window::OneHour => 60,
        }
    }

    pub fn span_seconds(&self) -> i64 {
        self.bucket_seconds() * self.bucket_count()
    }

    /// Key TTL: the window plus two buckets of slack so reads never race
    /// expiry of the oldest still-countable bucket.
    fn retention_seconds(&self) -> i64 {
        self.span_seconds() + 2 * self.bucket_seconds()
    }

    fn bucket_for(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.bucket_seconds())
    }
}

fn cnt_key(mint: &str, window: Window, bucket: i64, field: &str) -> String {
    format!("cnt:{mint}:{}:{bucket}:{field}", window.label())
}

fn hll_key(mint: &str, window: Window, bucket: i64, kind: &str) -> String {
    format!("hll:{mint}:{}:{bucket}:{kind}", window.label())
}

fn top_key(mint: &str, window: Window) -> String {
    format!("top:{mint}:{}", window.label())
}

fn first_seen_key(wallet: &str) -> String {
    format!("wallet:first_seen:{wallet}")
}

/// Bucketed rolling counters with HLL uniques and an approximate top-K
/// heavy-hitter set, all keyed per (mint, window).
#[derive(Clone)]
pub struct CounterStore {
    conn: ConnectionManager,
}

impl CounterStore {
    pub fn new(store: &RedisStore) -> Self {
        Self {
            conn: store.connection(),
        }
    }

    pub async fn record_swap(
        &self,
        mint: &str,
        wallet: &str,
        quote_sol: f64,
        side: SwapSide,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        let (count_field, volume_field, unique_kind) = match side {
            SwapSide::Buy => ("buys", "buy_vol", "buyers"),
            SwapSide::Sell => ("sells", "sell_vol", "sellers"),
        };

        for window in Window::ALL {
            let bucket = window.bucket_for(ts);
            let retention = window.retention_seconds();

            let count_key = cnt_key(mint, window, bucket, count_field);
            pipe.cmd("INCR").arg(&count_key).ignore();
            pipe.cmd("EXPIRE").arg(&count_key).arg(retention).ignore();

            let volume_key = cnt_key(mint, window, bucket, volume_field);
            pipe.cmd("INCRBYFLOAT")
                .arg(&volume_key)
                .arg(quote_sol)
                .ignore();
            pipe.cmd("EXPIRE").arg(&volume_key).arg(retention).ignore();

            let unique_key = hll_key(mint, window, bucket, unique_kind);
            pipe.cmd("PFADD").arg(&unique_key).arg(wallet).ignore();
            pipe.cmd("EXPIRE").arg(&unique_key).arg(retention).ignore();

            if side == SwapSide::Buy {
                let heavy_key = top_key(mint, window);
                pipe.cmd("ZINCRBY")
                    .arg(&heavy_key)
                    .arg(quote_sol)
                    .arg(wallet)
                    .ignore();
                pipe.cmd("EXPIRE")
                    .arg(&heavy_key)
                    .arg(window.span_seconds() + 60)
                    .ignore();
            }
        }

        // Inside the per-wallet write path on purpose: first-seen must land
        // for every wallet in a batch, not only the last one processed.
        pipe.cmd("SET")
            .arg(first_seen_key(wallet))
            .arg(ts.timestamp())
            .arg("NX")
            .arg("EX")
            .arg(WALLET_FIRST_SEEN_TTL_SECONDS)
            .ignore();

        let mut conn = self.conn.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .context("failed recording swap counters")?;
        Ok(())
    }

    pub async fn snapshot(&self, mint: &str, now: DateTime<Utc>) -> Result<MintSnapshot> {
        let stats_5m = self.window_stats(mint, Window::FiveMin, now).await?;
        let stats_1h = self.window_stats(mint, Window::OneHour, now).await?;
        Ok(MintSnapshot {
            mint: mint.to_string(),
            stats_5m,
            stats_1h,
        })
    }

    pub async fn window_stats(
        &self,
        mint: &str,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<WindowStats> {
        let mut conn = self.conn.clone();
        let current_bucket = window.bucket_for(now);
        let buckets: Vec<i64> = (0..window.bucket_count())
            .map(|offset| current_bucket - offset)
            .collect();

        let mut pipe = redis::pipe();
        for field in ["buys", "sells", "buy_vol", "sell_vol"] {
            for bucket in &buckets {
                pipe.cmd("GET").arg(cnt_key(mint, window, *bucket, field));
            }
        }
        let values: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .context("failed reading counter buckets")?;

        let per_field = buckets.len();
        let buy_count = sum_integers(&values[..per_field]);
        let sell_count = sum_integers(&values[per_field..2 * per_field]);
        let buy_volume = sum_floats(&values[2 * per_field..3 * per_field]);
        let sell_volume = sum_floats(&values[3 * per_field..4 * per_field]);

        let buyer_keys: Vec<String> = buckets
            .iter()
            .map(|bucket| hll_key(mint, window, *bucket, "buyers"))
            .collect();
        let seller_keys: Vec<String> = buckets
            .iter()
            .map(|bucket| hll_key(mint, window, *bucket, "sellers"))
            .collect();
        // PFCOUNT over every live bucket key estimates the union across the
        // whole window.
        let unique_buyers: u64 = conn
            .pfcount(&buyer_keys)
            .await
            .context("failed counting unique buyers")?;
        let unique_sellers: u64 = conn
            .pfcount(&seller_keys)
            .await
            .context("failed counting unique sellers")?;

        let top_entries: Vec<(String, f64)> = conn
            .zrevrange_withscores(top_key(mint, window), 0, NEW_WALLET_SCAN_LIMIT - 1)
            .await
            .context("failed reading heavy hitters")?;

        let top_buyers: Vec<(String, f64)> = top_entries.iter().take(3).cloned().collect();
        let top_3_volume: f64 = top_buyers.iter().map(|(_, volume)| volume).sum();
        let top_3_buyers_volume_share = if buy_volume > 0.0 {
            (top_3_volume / buy_volume).min(1.0)
        } else {
            0.0
        };

        let new_wallet_pct = self
            .new_wallet_fraction(&mut conn, &top_entries, unique_buyers, window, now)
            .await?;

        let buy_sell_ratio = if sell_count > 0 {
            buy_count as f64 / sell_count as f64
        } else if buy_count > 0 {
            f64::INFINITY
        } else {
            0.0
        };
        let avg_buy_size = buy_volume / buy_count.max(1) as f64;

        Ok(WindowStats {
            buy_count,
            sell_count,
            unique_buyers,
            unique_sellers,
            buy_volume_sol: buy_volume,
            sell_volume_sol: sell_volume,
            avg_buy_size,
            buy_sell_ratio,
            top_buyers,
            top_3_buyers_volume_share,
            new_wallet_pct,
        })
    }

    pub async fn wallet_first_seen(&self, wallet: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn
            .get(first_seen_key(wallet))
            .await
            .context("failed reading wallet first-seen")?;
        Ok(value)
    }

    async fn new_wallet_fraction(
        &self,
        conn: &mut ConnectionManager,
        wallets: &[(String, f64)],
        unique_buyers: u64,
        window: Window,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        if wallets.is_empty() || unique_buyers == 0 {
            return Ok(0.0);
        }
        let keys: Vec<String> = wallets
            .iter()
            .map(|(wallet, _)| first_seen_key(wallet))
            .collect();
        let first_seen: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(conn)
            .await
            .context("failed reading wallet first-seen batch")?;

        let window_start = now.timestamp() - window.span_seconds();
        let new_count = first_seen
            .iter()
            .flatten()
            .filter(|ts| **ts >= window_start)
            .count();
        Ok((new_count as f64 / unique_buyers as f64).min(1.0))
    }
}

fn sum_integers(values: &[Option<String>]) -> u64 {
    values
        .iter()
        .flatten()
        .filter_map(|value| value.parse::<u64>().ok())
        .sum()
}

fn sum_floats(values: &[Option<String>]) -> f64 {
    values
        .iter()
        .flatten()
        .filter_map(|value| value.parse::<f64>().ok())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_geometry_matches_contract() {
        assert_eq!(Window::FiveMin.bucket_seconds(), 10);
        assert_eq!(Window::FiveMin.bucket_count(), 30);
        assert_eq!(Window::FiveMin.span_seconds(), 300);
        assert_eq!(Window::OneHour.bucket_seconds(), 60);
        assert_eq!(Window::OneHour.bucket_count(), 60);
        assert_eq!(Window::OneHour.span_seconds(), 3_600);
    }

    #[test]
    fn key_schema_matches_contract() {
        assert_eq!(
            cnt_key("MintM", Window::FiveMin, 12345, "buys"),
            "cnt:MintM:5m:12345:buys"
        );
        assert_eq!(
            hll_key("MintM", Window::OneHour, 678, "buyers"),
            "hll:MintM:1h:678:buyers"
        );
        assert_eq!(top_key("MintM", Window::FiveMin), "top:MintM:5m");
        assert_eq!(first_seen_key("walletA"), "wallet:first_seen:walletA");
    }

    #[test]
    fn bucket_sums_skip_missing_keys() {
        let values = vec![Some("3".to_string()), None, Some("4".to_string())];
        assert_eq!(sum_integers(&values), 7);
        let floats = vec![Some("0.5".to_string()), None, Some("1.25".to_string())];
        assert!((sum_floats(&floats) - 1.75).abs() < 1e-9);
    }
}
