use mintwatch_core_types::{CtoScore, WindowStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::warn;

use crate::clustering::WalletClusterer;

const WEIGHT_CLUSTER: f64 = 0.30;
const WEIGHT_CONCENTRATION: f64 = 0.25;
const WEIGHT_TIMING: f64 = 0.15;
const WEIGHT_NEW_WALLET: f64 = 0.15;
const WEIGHT_RATIO: f64 = 0.15;
const RATIO_CAP: f64 = 10.0;

/// Weighted coordination likelihood for a HOT mint. Pure given its inputs;
/// the deadline handling lives in `ScoreService`.
pub fn score_components(
    stats: &WindowStats,
    buy_timestamps: &[i64],
    cluster_share: Option<f64>,
) -> CtoScore {
    let mut evidence = Vec::new();

    let cluster = cluster_share.unwrap_or(0.0).clamp(0.0, 1.0);
    if cluster >= 0.5 {
        evidence.push(format!("linked wallets hold {:.0}% of buy volume", cluster * 100.0));
    }

    let concentration = stats.top_3_buyers_volume_share.clamp(0.0, 1.0);
    if concentration >= 0.6 {
        evidence.push(format!(
            "top 3 buyers hold {:.0}% of volume",
            concentration * 100.0
        ));
    }

    let timing = burstiness(buy_timestamps);
    if timing >= 0.7 {
        evidence.push("buy timing is heavily bursty".to_string());
    }

    let new_wallet = stats.new_wallet_pct.clamp(0.0, 1.0);
    if new_wallet >= 0.5 {
        evidence.push(format!("{:.0}% of buyers are new wallets", new_wallet * 100.0));
    }

    let ratio = if stats.buy_sell_ratio.is_infinite() {
        evidence.push("all buys, no sells".to_string());
        1.0
    } else {
        (stats.buy_sell_ratio / RATIO_CAP).clamp(0.0, 1.0)
    };

    let total = cluster * WEIGHT_CLUSTER
        + concentration * WEIGHT_CONCENTRATION
        + timing * WEIGHT_TIMING
        + new_wallet * WEIGHT_NEW_WALLET
        + ratio * WEIGHT_RATIO;

    CtoScore {
        total,
        cluster,
        concentration,
        timing,
        new_wallet,
        ratio,
        cluster_timed_out: false,
        evidence,
    }
}

/// Normalized inter-arrival burstiness of buy timestamps: 0 for regular
/// arrivals, approaching 1 for tight synchronized bursts. Needs at least
/// three timestamps to say anything.
pub fn burstiness(timestamps: &[i64]) -> f64 {
    if timestamps.len() < 3 {
        return 0.0;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();

    let gaps: Vec<f64> = sorted
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) as f64)
        .collect();
    let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
    if mean <= 0.0 {
        // Every buy in the same second.
        return 1.0;
    }
    let variance = gaps
        .iter()
        .map(|gap| (gap - mean) * (gap - mean))
        .sum::<f64>()
        / gaps.len() as f64;
    let std_dev = variance.sqrt();

    // (sigma - mu) / (sigma + mu) spans [-1, 1]; rescale into [0, 1].
    (((std_dev - mean) / (std_dev + mean)) + 1.0) / 2.0
}

/// Runs scoring in a bounded pool with a per-call deadline. On deadline the
/// cluster and timing components are dropped, never the whole score, so an
/// alert always carries something.
pub struct ScoreService {
    clusterer: Arc<WalletClusterer>,
    pool: Arc<Semaphore>,
    deadline: Duration,
}

impl ScoreService {
    pub fn new(clusterer: Arc<WalletClusterer>, pool_size: usize, deadline: Duration) -> Self {
        Self {
            clusterer,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            deadline,
        }
    }

    pub fn clusterer(&self) -> Arc<WalletClusterer> {
        Arc::clone(&self.clusterer)
    }

    pub async fn score(
        &self,
        mint: &str,
        stats: &WindowStats,
        buy_timestamps: &[i64],
    ) -> CtoScore {
        let _permit = match self.pool.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return degraded_score(stats),
        };

        let clusterer = Arc::clone(&self.clusterer);
        let buyers = stats.top_buyers.clone();
        let share_task =
            tokio::task::spawn_blocking(move || clusterer.max_cluster_share(&buyers));

        match time::timeout(self.deadline, share_task).await {
            Ok(Ok(share)) => score_components(stats, buy_timestamps, Some(share)),
            Ok(Err(error)) => {
                warn!(mint, error = %error, "cluster share task failed, degrading score");
                degraded_score(stats)
            }
            Err(_) => {
                warn!(mint, deadline_ms = self.deadline.as_millis() as u64, "score deadline hit");
                degraded_score(stats)
            }
        }
    }
}

/// Fallback when cluster data is unavailable in time: only concentration,
/// new-wallet, and ratio contribute.
fn degraded_score(stats: &WindowStats) -> CtoScore {
    let mut score = score_components(stats, &[], None);
    score.timing = 0.0;
    score.cluster_timed_out = true;
    score.total = score.concentration * WEIGHT_CONCENTRATION
        + score.new_wallet * WEIGHT_NEW_WALLET
        + score.ratio * WEIGHT_RATIO;
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(top_3_share: f64, new_wallet_pct: f64, ratio: f64) -> WindowStats {
        WindowStats {
            buy_count: 20,
            sell_count: 2,
            unique_buyers: 8,
            buy_volume_sol: 10.0,
            top_3_buyers_volume_share: top_3_share,
            new_wallet_pct,
            buy_sell_ratio: ratio,
            top_buyers: vec![
                ("walletA".to_string(), 4.0),
                ("walletB".to_string(), 3.0),
                ("walletC".to_string(), 1.0),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn weights_sum_to_one() {
        let total =
            WEIGHT_CLUSTER + WEIGHT_CONCENTRATION + WEIGHT_TIMING + WEIGHT_NEW_WALLET + WEIGHT_RATIO;
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn fully_coordinated_inputs_score_one() {
        let stats = stats(1.0, 1.0, f64::INFINITY);
        let same_second = vec![100, 100, 100, 100];
        let score = score_components(&stats, &same_second, Some(1.0));
        assert!((score.total - 1.0).abs() < 1e-9, "total {}", score.total);
        assert!(!score.evidence.is_empty());
    }

    #[test]
    fn missing_inputs_contribute_zero() {
        let empty = WindowStats::default();
        let score = score_components(&empty, &[], None);
        assert_eq!(score.total, 0.0);
        assert_eq!(score.cluster, 0.0);
        assert_eq!(score.timing, 0.0);
    }

    #[test]
    fn ratio_component_caps_at_ten_to_one() {
        let score = score_components(&stats(0.0, 0.0, 25.0), &[], None);
        assert_eq!(score.ratio, 1.0);
        let score = score_components(&stats(0.0, 0.0, 5.0), &[], None);
        assert!((score.ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn regular_arrivals_are_not_bursty() {
        let regular: Vec<i64> = (0..10).map(|index| index * 60).collect();
        assert!(burstiness(&regular) < 0.1);
    }

    #[test]
    fn synchronized_arrivals_are_maximally_bursty() {
        assert_eq!(burstiness(&[50, 50, 50, 50, 50]), 1.0);
    }

    #[test]
    fn too_few_timestamps_yield_zero_timing() {
        assert_eq!(burstiness(&[1, 2]), 0.0);
    }

    #[tokio::test]
    async fn deadline_degrades_to_partial_components() {
        let clusterer = Arc::new(WalletClusterer::new());
        let service = ScoreService::new(clusterer, 2, Duration::from_millis(0));
        let stats = stats(0.8, 0.6, f64::INFINITY);

        let score = service.score("MintM", &stats, &[1, 2, 3]).await;
        assert!(score.cluster_timed_out);
        assert_eq!(score.cluster, 0.0);
        assert_eq!(score.timing, 0.0);
        let expected = 0.8 * WEIGHT_CONCENTRATION + 0.6 * WEIGHT_NEW_WALLET + 1.0 * WEIGHT_RATIO;
        assert!((score.total - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn score_includes_cluster_share_within_deadline() {
        let clusterer = Arc::new(WalletClusterer::new());
        clusterer.link_funding("walletA", "walletB");
        let service = ScoreService::new(clusterer, 2, Duration::from_secs(2));
        let stats = stats(0.8, 0.0, 0.0);

        let score = service.score("MintM", &stats, &[]).await;
        assert!(!score.cluster_timed_out);
        // walletA (4.0) + walletB (3.0) linked out of 8.0 total.
        assert!((score.cluster - 0.875).abs() < 1e-9, "cluster {}", score.cluster);
    }
}
