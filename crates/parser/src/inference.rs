use mintwatch_core_types::SwapSide;
use std::collections::{HashSet, VecDeque};

use crate::deltas::DeltaSet;

/// Quote below this multiple of the transaction fee looks like fee/rent
/// noise rather than a swap leg.
const QUOTE_FEE_RATIO_MIN: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct InferenceParams {
    pub min_native_delta_sol: f64,
    pub penalty_missing_venue: f64,
    pub penalty_competing_deltas: f64,
    pub penalty_fee_ratio: f64,
    pub penalty_unseen_mint: f64,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            min_native_delta_sol: 0.001,
            penalty_missing_venue: 0.1,
            penalty_competing_deltas: 0.2,
            penalty_fee_ratio: 0.1,
            penalty_unseen_mint: 0.05,
        }
    }
}

/// Bounded recency cache of base mints already observed by this consumer.
/// Never-seen mints carry a small confidence penalty.
#[derive(Debug, Default)]
pub struct SeenMintCache {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenMintCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(16),
        }
    }

    pub fn contains(&self, mint: &str) -> bool {
        self.set.contains(mint)
    }

    pub fn note(&mut self, mint: &str) {
        if self.set.insert(mint.to_string()) {
            self.order.push_back(mint.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapCandidate {
    pub wallet: String,
    pub side: SwapSide,
    pub base_mint: String,
    pub base_amount: f64,
    pub quote_amount_sol: f64,
    pub confidence: f64,
}

/// Balance-delta swap inference. Pure: identical inputs (including the seen
/// cache contents) always produce the identical candidate.
pub struct SwapInferencer {
    params: InferenceParams,
}

impl SwapInferencer {
    pub fn new(params: InferenceParams) -> Self {
        Self { params }
    }

    pub fn infer(&self, deltas: &DeltaSet, seen: &SeenMintCache) -> Option<SwapCandidate> {
        let mut best: Option<Candidate> = None;

        for ((owner, mint), token_delta) in &deltas.token_deltas {
            if *token_delta == 0.0 {
                continue;
            }
            let native_delta = deltas.native_deltas.get(owner).copied().unwrap_or(0.0);
            if native_delta.abs() < self.params.min_native_delta_sol {
                continue;
            }

            let side = if *token_delta > 0.0 && native_delta < 0.0 {
                SwapSide::Buy
            } else if *token_delta < 0.0 && native_delta > 0.0 {
                SwapSide::Sell
            } else {
                continue;
            };

            let candidate = Candidate {
                owner,
                mint,
                token_delta: *token_delta,
                native_delta,
                side,
            };
            best = Some(match best.take() {
                None => candidate,
                Some(current) => pick_dominant(current, candidate),
            });
        }

        let chosen = best?;

        let competing = deltas
            .token_deltas
            .iter()
            .filter(|((owner, _), delta)| owner == chosen.owner && **delta != 0.0)
            .count();

        let mut confidence = 1.0;
        if deltas.venue_hint.is_none() {
            confidence -= self.params.penalty_missing_venue;
        }
        if competing > 1 {
            confidence -= self.params.penalty_competing_deltas;
        }
        if deltas.fee_sol > 0.0
            && chosen.native_delta.abs() / deltas.fee_sol < QUOTE_FEE_RATIO_MIN
        {
            confidence -= self.params.penalty_fee_ratio;
        }
        if !seen.contains(chosen.mint) {
            confidence -= self.params.penalty_unseen_mint;
        }

        Some(SwapCandidate {
            wallet: chosen.owner.to_string(),
            side: chosen.side,
            base_mint: chosen.mint.to_string(),
            base_amount: chosen.token_delta.abs(),
            quote_amount_sol: chosen.native_delta.abs(),
            confidence: confidence.max(0.0),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    owner: &'a str,
    mint: &'a str,
    token_delta: f64,
    native_delta: f64,
    side: SwapSide,
}

fn pick_dominant<'a>(current: Candidate<'a>, challenger: Candidate<'a>) -> Candidate<'a> {
    let by_token = challenger
        .token_delta
        .abs()
        .partial_cmp(&current.token_delta.abs())
        .unwrap_or(std::cmp::Ordering::Equal);
    match by_token {
        std::cmp::Ordering::Greater => challenger,
        std::cmp::Ordering::Less => current,
        std::cmp::Ordering::Equal => {
            let by_native = challenger
                .native_delta
                .abs()
                .partial_cmp(&current.native_delta.abs())
                .unwrap_or(std::cmp::Ordering::Equal);
            match by_native {
                std::cmp::Ordering::Greater => challenger,
                std::cmp::Ordering::Less => current,
                std::cmp::Ordering::Equal => {
                    if challenger.mint < current.mint {
                        challenger
                    } else {
                        current
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn delta_set(
        token: &[(&str, &str, f64)],
        native: &[(&str, f64)],
        venue: Option<&'static str>,
    ) -> DeltaSet {
        let mut token_deltas = HashMap::new();
        for (owner, mint, amount) in token {
            token_deltas.insert((owner.to_string(), mint.to_string()), *amount);
        }
        let mut native_deltas = HashMap::new();
        for (owner, amount) in native {
            native_deltas.insert(owner.to_string(), *amount);
        }
        DeltaSet {
            token_deltas,
            native_deltas,
            venue_hint: venue,
            mints_touched: vec![],
            fee_sol: 0.000_005,
        }
    }

    fn inferencer() -> SwapInferencer {
        SwapInferencer::new(InferenceParams::default())
    }

    #[test]
    fn simple_buy_scores_high_confidence() {
        let deltas = delta_set(
            &[("walletA", "MintM", 100.0)],
            &[("walletA", -0.5)],
            Some("pump"),
        );
        let mut seen = SeenMintCache::new(16);
        seen.note("MintM");

        let swap = inferencer().infer(&deltas, &seen).expect("buy inferred");
        assert_eq!(swap.side, SwapSide::Buy);
        assert_eq!(swap.base_mint, "MintM");
        assert_eq!(swap.wallet, "walletA");
        assert!((swap.base_amount - 100.0).abs() < 1e-9);
        assert!((swap.quote_amount_sol - 0.5).abs() < 1e-9);
        assert!(swap.confidence >= 0.9, "confidence {}", swap.confidence);
    }

    #[test]
    fn unseen_mint_still_clears_default_floor() {
        let deltas = delta_set(
            &[("walletA", "FreshMint", 100.0)],
            &[("walletA", -0.5)],
            Some("pump"),
        );
        let seen = SeenMintCache::new(16);
        let swap = inferencer().infer(&deltas, &seen).expect("buy inferred");
        assert!((swap.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn sell_is_the_symmetric_inverse() {
        let deltas = delta_set(
            &[("walletA", "MintM", -250.0)],
            &[("walletA", 1.2)],
            Some("raydium"),
        );
        let mut seen = SeenMintCache::new(16);
        seen.note("MintM");
        let swap = inferencer().infer(&deltas, &seen).expect("sell inferred");
        assert_eq!(swap.side, SwapSide::Sell);
        assert!((swap.quote_amount_sol - 1.2).abs() < 1e-9);
    }

    #[test]
    fn dust_native_delta_yields_no_swap() {
        let deltas = delta_set(
            &[("walletA", "MintM", 100.0)],
            &[("walletA", -0.000_1)],
            Some("pump"),
        );
        let seen = SeenMintCache::new(16);
        assert!(inferencer().infer(&deltas, &seen).is_none());
    }

    #[test]
    fn same_sign_deltas_are_not_a_swap() {
        let deltas = delta_set(
            &[("walletA", "MintM", 100.0)],
            &[("walletA", 0.5)],
            Some("pump"),
        );
        let seen = SeenMintCache::new(16);
        assert!(inferencer().infer(&deltas, &seen).is_none());
    }

    #[test]
    fn dominant_token_delta_wins_with_competing_penalty() {
        let deltas = delta_set(
            &[
                ("walletA", "MintBig", 900.0),
                ("walletA", "MintSmall", 10.0),
            ],
            &[("walletA", -1.0)],
            Some("pump"),
        );
        let mut seen = SeenMintCache::new(16);
        seen.note("MintBig");
        seen.note("MintSmall");

        let swap = inferencer().infer(&deltas, &seen).expect("dominant leg");
        assert_eq!(swap.base_mint, "MintBig");
        // 1.0 - competing(0.2)
        assert!((swap.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn equal_magnitudes_break_ties_lexicographically() {
        let deltas = delta_set(
            &[("walletA", "Zeta", 50.0), ("walletB", "Alpha", 50.0)],
            &[("walletA", -0.4), ("walletB", -0.4)],
            Some("pump"),
        );
        let mut seen = SeenMintCache::new(16);
        seen.note("Zeta");
        seen.note("Alpha");

        let swap = inferencer().infer(&deltas, &seen).expect("tie resolved");
        assert_eq!(swap.base_mint, "Alpha");
    }

    #[test]
    fn missing_venue_and_fee_noise_stack_penalties() {
        let mut deltas = delta_set(&[("walletA", "MintM", 5.0)], &[("walletA", -0.005)], None);
        deltas.fee_sol = 0.001;
        let mut seen = SeenMintCache::new(16);
        seen.note("MintM");

        let swap = inferencer().infer(&deltas, &seen).expect("still inferred");
        // 1.0 - venue(0.1) - fee ratio(0.1): 0.005/0.001 = 5x fee, below 20x.
        assert!((swap.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn seen_cache_evicts_oldest_beyond_capacity() {
        let mut seen = SeenMintCache::new(16);
        for index in 0..20 {
            seen.note(&format!("mint-{index}"));
        }
        assert!(!seen.contains("mint-0"));
        assert!(seen.contains("mint-19"));
    }

    #[test]
    fn inference_is_deterministic_for_identical_inputs() {
        let deltas = delta_set(
            &[("walletA", "MintA", 10.0), ("walletB", "MintB", 10.0)],
            &[("walletA", -0.3), ("walletB", -0.3)],
            Some("pump"),
        );
        let seen = SeenMintCache::new(16);
        let first = inferencer().infer(&deltas, &seen);
        let second = inferencer().infer(&deltas, &seen);
        assert_eq!(first, second);
    }
}
