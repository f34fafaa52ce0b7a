use anyhow::Result;
use chrono::Utc;
use mintwatch_config::DetectionConfig;
use mintwatch_core_types::{Mode, RawTransaction, SwapEvent, SwapSide, TxDeltaRecord};
use mintwatch_deltalog::DeltaLog;
use mintwatch_detection::{ModeCell, StateManager};
use mintwatch_enrichment::{estimate_mcap_sol, EnrichmentClient, TokenSupply, WalletClusterer};
use mintwatch_parser::{
    is_known_venue_program, DeltaExtractor, DeltaSet, InferenceParams, SeenMintCache,
    SwapInferencer,
};
use mintwatch_store::{AppendSink, CounterStore, TokenKeys};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::metrics::Metrics;

const BUY_TIMES_PER_MINT: usize = 512;
const UNKNOWN_PROGRAM_LOG_THRESHOLD: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Swap,
    MintTouch,
    CriticalSkip,
}

/// Per-record processing shared by live consumers and HOT backfill: deltas,
/// inference, counters, delta log, and NORMAL-mode persistence. The
/// published mode decides how much of the pipeline runs.
pub struct SwapPipeline {
    pub counters: CounterStore,
    pub delta_log: DeltaLog,
    pub sink: AppendSink,
    pub state: Arc<StateManager>,
    pub clusterer: Arc<WalletClusterer>,
    pub tokens: TokenKeys,
    pub mode: Arc<ModeCell>,
    pub metrics: Arc<Metrics>,
    pub enrichment: Arc<EnrichmentClient>,
    inferencer: SwapInferencer,
    min_confidence_bits: AtomicU64,
    buy_times: Mutex<HashMap<String, VecDeque<i64>>>,
    entry_mcaps: Mutex<HashMap<String, (f64, u64)>>,
    supply_cache: AsyncMutex<HashMap<String, Option<TokenSupply>>>,
    unknown_program_counts: Mutex<HashMap<String, u64>>,
}

impl SwapPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detection: &DetectionConfig,
        counters: CounterStore,
        delta_log: DeltaLog,
        sink: AppendSink,
        state: Arc<StateManager>,
        clusterer: Arc<WalletClusterer>,
        tokens: TokenKeys,
        mode: Arc<ModeCell>,
        metrics: Arc<Metrics>,
        enrichment: Arc<EnrichmentClient>,
    ) -> Self {
        let inferencer = SwapInferencer::new(InferenceParams {
            min_native_delta_sol: detection.min_native_delta_sol,
            penalty_missing_venue: detection.penalty_missing_venue,
            penalty_competing_deltas: detection.penalty_competing_deltas,
            penalty_fee_ratio: detection.penalty_fee_ratio,
            penalty_unseen_mint: detection.penalty_unseen_mint,
        });
        Self {
            counters,
            delta_log,
            sink,
            state,
            clusterer,
            tokens,
            mode,
            metrics,
            enrichment,
            inferencer,
            min_confidence_bits: AtomicU64::new(detection.min_swap_confidence.to_bits()),
            buy_times: Mutex::new(HashMap::new()),
            entry_mcaps: Mutex::new(HashMap::new()),
            supply_cache: AsyncMutex::new(HashMap::new()),
            unknown_program_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_confidence(&self) -> f64 {
        f64::from_bits(self.min_confidence_bits.load(Ordering::Relaxed))
    }

    /// Hot-reload entry for the `detection` config section.
    pub fn set_min_confidence(&self, floor: f64) {
        self.min_confidence_bits
            .store(floor.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub async fn process_record(
        &self,
        tx: &RawTransaction,
        seen: &mut SeenMintCache,
    ) -> Result<ProcessOutcome> {
        let mode = self.mode.load();
        let deltas = DeltaExtractor::extract(tx);
        let ts = tx.effective_time();

        for mint in &deltas.mints_touched {
            self.state.note_activity(mint, ts);
        }

        self.delta_log.append(TxDeltaRecord {
            signature: tx.signature.clone(),
            slot: tx.slot,
            ts_unix: ts.timestamp(),
            fee_payer: tx.fee_payer().to_string(),
            token_deltas: deltas
                .token_deltas
                .iter()
                .map(|((owner, mint), amount)| (owner.clone(), mint.clone(), *amount))
                .collect(),
            native_deltas: deltas
                .native_deltas
                .iter()
                .map(|(owner, amount)| (owner.clone(), *amount))
                .collect(),
            mints_touched: deltas.mints_touched.clone(),
            program_ids: tx.program_ids_touched.clone(),
        });

        if mode == Mode::Critical {
            // Coverage over detail: the record is logged and acked, counters
            // and inference wait for recovery (or HOT backfill).
            return Ok(ProcessOutcome::CriticalSkip);
        }

        self.track_unknown_programs(tx).await;

        let Some(candidate) = self.inferencer.infer(&deltas, seen) else {
            self.metrics.incr(&self.metrics.mint_touches);
            return Ok(ProcessOutcome::MintTouch);
        };
        if candidate.confidence < self.min_confidence() {
            self.metrics.incr(&self.metrics.mint_touches);
            return Ok(ProcessOutcome::MintTouch);
        }

        seen.note(&candidate.base_mint);
        self.metrics.incr(&self.metrics.swaps_detected);

        let mut swap = SwapEvent {
            signature: tx.signature.clone(),
            slot: tx.slot,
            side: candidate.side,
            base_mint: candidate.base_mint.clone(),
            quote_mint: mintwatch_core_types::NATIVE_MINT.to_string(),
            base_amount: candidate.base_amount,
            quote_amount: candidate.quote_amount_sol,
            wallet: candidate.wallet.clone(),
            venue: deltas.venue_hint.unwrap_or("unknown").to_string(),
            confidence: candidate.confidence,
            mcap_at_swap: None,
            ts_utc: ts,
        };

        self.counters
            .record_swap(
                &swap.base_mint,
                &swap.wallet,
                swap.quote_amount,
                swap.side,
                ts,
            )
            .await?;

        if swap.side == SwapSide::Buy {
            self.clusterer.note_buy(&swap.wallet, swap.quote_amount);
            self.note_buy_time(&swap.base_mint, ts.timestamp());
        }

        if mode == Mode::Normal {
            swap.mcap_at_swap = self.mcap_for_swap(&swap).await;
            if let Err(error) = self.sink.append_swap(&swap).await {
                // The counter updates above already landed; the failure is
                // recorded and the record still acks so the stream drains.
                self.metrics.incr(&self.metrics.sink_failures);
                warn!(
                    signature = %swap.signature,
                    error = %error,
                    "swap persist failed after retries"
                );
            } else {
                self.metrics.incr(&self.metrics.swaps_persisted);
            }
        }

        Ok(ProcessOutcome::Swap)
    }

    /// Replays one delta-log record through inference for HOT backfill.
    /// Counters were already updated on first sight (DEGRADED keeps them),
    /// so backfill only persists SwapEvents that NORMAL-mode would have.
    pub async fn backfill_record(&self, mint: &str, record: &TxDeltaRecord) -> Result<bool> {
        let deltas = delta_set_from_record(record);
        let mut seen = SeenMintCache::new(16);
        seen.note(mint);

        let Some(candidate) = self.inferencer.infer(&deltas, &seen) else {
            return Ok(false);
        };
        if candidate.base_mint != mint || candidate.confidence < self.min_confidence() {
            return Ok(false);
        }

        let ts = chrono::DateTime::from_timestamp(record.ts_unix, 0).unwrap_or_else(Utc::now);
        let mut swap = SwapEvent {
            signature: record.signature.clone(),
            slot: record.slot,
            side: candidate.side,
            base_mint: candidate.base_mint.clone(),
            quote_mint: mintwatch_core_types::NATIVE_MINT.to_string(),
            base_amount: candidate.base_amount,
            quote_amount: candidate.quote_amount_sol,
            wallet: candidate.wallet,
            venue: deltas.venue_hint.unwrap_or("unknown").to_string(),
            confidence: candidate.confidence,
            mcap_at_swap: None,
            ts_utc: ts,
        };
        swap.mcap_at_swap = self.mcap_for_swap(&swap).await;
        self.sink.append_swap(&swap).await?;
        Ok(true)
    }

    pub fn buy_timestamps(&self, mint: &str) -> Vec<i64> {
        let cutoff = Utc::now().timestamp() - 3_600;
        self.buy_times
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(mint)
            .map(|times| times.iter().copied().filter(|ts| *ts >= cutoff).collect())
            .unwrap_or_default()
    }

    pub fn avg_entry_mcap(&self, mint: &str) -> Option<f64> {
        self.entry_mcaps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(mint)
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| sum / *count as f64)
    }

    pub fn forget_mint(&self, mint: &str) {
        self.buy_times
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(mint);
        self.entry_mcaps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(mint);
    }

    fn note_buy_time(&self, mint: &str, ts_unix: i64) {
        let mut guard = self
            .buy_times
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let times = guard.entry(mint.to_string()).or_default();
        times.push_back(ts_unix);
        while times.len() > BUY_TIMES_PER_MINT {
            times.pop_front();
        }
    }

    async fn mcap_for_swap(&self, swap: &SwapEvent) -> Option<f64> {
        if self.enrichment.is_degraded() {
            return None;
        }
        let supply = self.cached_supply(&swap.base_mint).await?;
        let mcap = estimate_mcap_sol(swap.quote_amount, swap.base_amount, &supply)?;

        {
            let mut guard = self
                .entry_mcaps
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = guard.entry(swap.base_mint.clone()).or_insert((0.0, 0));
            entry.0 += mcap;
            entry.1 += 1;
        }

        let price = swap.quote_amount / swap.base_amount;
        if let Err(error) = self.tokens.set_mcap(&swap.base_mint, mcap, price).await {
            debug!(mint = %swap.base_mint, error = %error, "mcap cache write failed");
        }
        Some(mcap)
    }

    async fn cached_supply(&self, mint: &str) -> Option<TokenSupply> {
        {
            let cache = self.supply_cache.lock().await;
            if let Some(cached) = cache.get(mint) {
                return cached.clone();
            }
        }
        let fetched = match self.enrichment.token_supply(mint).await {
            Ok(supply) => supply,
            Err(error) => {
                debug!(mint, error = %error, "token supply lookup failed");
                return None;
            }
        };
        let mut cache = self.supply_cache.lock().await;
        cache.insert(mint.to_string(), fetched.clone());
        fetched
    }

    async fn track_unknown_programs(&self, tx: &RawTransaction) {
        let known: Vec<String> = tx
            .program_ids_touched
            .iter()
            .filter(|program| is_known_venue_program(program))
            .cloned()
            .collect();
        let unknown: Vec<String> = tx
            .program_ids_touched
            .iter()
            .filter(|program| !is_known_venue_program(program))
            .cloned()
            .collect();

        for program_id in unknown {
            let local_count = {
                let mut counts = self
                    .unknown_program_counts
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                let entry = counts.entry(program_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if local_count == UNKNOWN_PROGRAM_LOG_THRESHOLD {
                warn!(
                    program_id = %program_id,
                    occurrences = local_count,
                    cooccurs_with = ?known,
                    "unknown program seen repeatedly alongside swap venues"
                );
            }
            if let Err(error) = self
                .tokens
                .track_unknown_program(&program_id, tx.slot, &known)
                .await
            {
                debug!(error = %error, "unknown program tracking failed");
            }
        }
    }
}

fn delta_set_from_record(record: &TxDeltaRecord) -> DeltaSet {
    let mut token_deltas = HashMap::new();
    for (owner, mint, amount) in &record.token_deltas {
        token_deltas.insert((owner.clone(), mint.clone()), *amount);
    }
    let mut native_deltas = HashMap::new();
    for (owner, amount) in &record.native_deltas {
        native_deltas.insert(owner.clone(), *amount);
    }
    let venue_hint = record
        .program_ids
        .iter()
        .filter_map(|program| mintwatch_parser::venue_for_program(program))
        .next();
    DeltaSet {
        token_deltas,
        native_deltas,
        venue_hint,
        mints_touched: record.mints_touched.clone(),
        fee_sol: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_set_reconstruction_preserves_legs() {
        let record = TxDeltaRecord {
            signature: "sig".to_string(),
            slot: 5,
            ts_unix: 1_700_000_000,
            fee_payer: "walletA".to_string(),
            token_deltas: vec![("walletA".to_string(), "MintM".to_string(), 100.0)],
            native_deltas: vec![("walletA".to_string(), -0.5)],
            mints_touched: vec!["MintM".to_string()],
            program_ids: vec!["6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P".to_string()],
        };
        let deltas = delta_set_from_record(&record);
        assert_eq!(
            deltas.token_deltas[&("walletA".to_string(), "MintM".to_string())],
            100.0
        );
        assert_eq!(deltas.native_deltas["walletA"], -0.5);
        assert_eq!(deltas.venue_hint, Some("pump"));
    }
}
