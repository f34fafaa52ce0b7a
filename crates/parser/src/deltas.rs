use mintwatch_core_types::{RawTransaction, LAMPORTS_PER_SOL, NATIVE_MINT};
use std::collections::{BTreeSet, HashMap};

/// Rent-exempt minimums for the two account shapes swap venues create on the
/// fly. Transfers of exactly these amounts into a fresh account are rent, not
/// quote.
pub const ATA_RENT_LAMPORTS: u64 = 2_039_280;
pub const ACCOUNT_RENT_LAMPORTS: u64 = 890_880;

/// Recognized venue programs. The venue hint is the first *touched* program
/// (in transaction order) that appears in this table; table order carries no
/// precedence.
pub const VENUE_PROGRAMS: &[(&str, &str)] = &[
    ("6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P", "pump"),
    ("pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA", "pump"),
    ("JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4", "jupiter"),
    ("675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8", "raydium"),
    ("CPMMoo8L3F4NbTegBCKVNunggL7H1ZpdTHKxQB5qKP1C", "raydium"),
    ("CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK", "raydium"),
    ("whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc", "orca"),
    ("LBUZKhRxPF3XUpBCjp4YzTKgLccjZhTSDM9YuVaPwxo", "meteora"),
];

pub fn venue_for_program(program_id: &str) -> Option<&'static str> {
    VENUE_PROGRAMS
        .iter()
        .find(|(id, _)| *id == program_id)
        .map(|(_, venue)| *venue)
}

pub fn is_known_venue_program(program_id: &str) -> bool {
    venue_for_program(program_id).is_some()
}

/// Balance changes extracted from a single transaction. Token deltas exclude
/// the wrapped-native mint, which is folded into `native_deltas` per owner.
#[derive(Debug, Clone, Default)]
pub struct DeltaSet {
    pub token_deltas: HashMap<(String, String), f64>,
    pub native_deltas: HashMap<String, f64>,
    pub venue_hint: Option<&'static str>,
    pub mints_touched: Vec<String>,
    pub fee_sol: f64,
}

pub struct DeltaExtractor;

impl DeltaExtractor {
    pub fn extract(tx: &RawTransaction) -> DeltaSet {
        let fee_payer = tx.fee_payer().to_string();

        let pre = Self::index_token_balances(&tx.pre_token_balances);
        let post = Self::index_token_balances(&tx.post_token_balances);

        let mut token_deltas: HashMap<(String, String), f64> = HashMap::new();
        let mut native_deltas: HashMap<String, f64> = HashMap::new();
        let mut mints_touched: BTreeSet<String> = BTreeSet::new();

        let mut keys: BTreeSet<&(String, String)> = pre.keys().collect();
        keys.extend(post.keys());
        for key in keys {
            let before = pre.get(key).copied().unwrap_or(0.0);
            let after = post.get(key).copied().unwrap_or(0.0);
            let delta = after - before;
            if delta == 0.0 {
                continue;
            }
            let (owner, mint) = key;
            if mint == NATIVE_MINT {
                *native_deltas.entry(owner.clone()).or_default() += delta;
            } else {
                mints_touched.insert(mint.clone());
                token_deltas.insert(key.clone(), delta);
            }
        }

        for (index, key) in tx.account_keys.iter().enumerate() {
            let before = tx.pre_lamports.get(index).copied().unwrap_or(0);
            let after = tx.post_lamports.get(index).copied().unwrap_or(0);
            let mut delta = after as i128 - before as i128;

            // The fee would otherwise read as quote spent by the payer.
            if *key == fee_payer {
                delta += tx.fee as i128;
            }

            // Fresh accounts funded with exactly a rent-exempt minimum are
            // account creation, not swap flow; larger fundings still carry
            // the rent on top of the real transfer.
            if before == 0 && after > 0 {
                if after == ATA_RENT_LAMPORTS || after == ACCOUNT_RENT_LAMPORTS {
                    continue;
                }
                delta -= ATA_RENT_LAMPORTS as i128;
            }

            if delta != 0 {
                *native_deltas.entry(key.clone()).or_default() +=
                    delta as f64 / LAMPORTS_PER_SOL;
            }
        }

        let venue_hint = tx
            .program_ids_touched
            .iter()
            .filter_map(|program| venue_for_program(program))
            .next();

        DeltaSet {
            token_deltas,
            native_deltas,
            venue_hint,
            mints_touched: mints_touched.into_iter().collect(),
            fee_sol: tx.fee as f64 / LAMPORTS_PER_SOL,
        }
    }

    fn index_token_balances(
        entries: &[mintwatch_core_types::TokenBalanceEntry],
    ) -> HashMap<(String, String), f64> {
        let mut out = HashMap::new();
        for entry in entries {
            if entry.owner.is_empty() || entry.mint.is_empty() {
                continue;
            }
            let ui_amount = entry.raw_amount as f64 / 10f64.powi(entry.decimals as i32);
            out.insert((entry.owner.clone(), entry.mint.clone()), ui_amount);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mintwatch_core_types::TokenBalanceEntry;

    fn balance(owner: &str, mint: &str, raw_amount: u64, decimals: u8) -> TokenBalanceEntry {
        TokenBalanceEntry {
            owner: owner.to_string(),
            mint: mint.to_string(),
            raw_amount,
            decimals,
        }
    }

    fn base_tx() -> RawTransaction {
        RawTransaction {
            signature: "sig-1".to_string(),
            slot: 100,
            ingest_time: Utc::now(),
            block_time: None,
            fee: 5_000,
            account_keys: vec!["walletA".to_string(), "pool".to_string()],
            pre_token_balances: vec![],
            post_token_balances: vec![],
            pre_lamports: vec![1_000_000_000, 0],
            post_lamports: vec![499_995_000, 0],
            program_ids_touched: vec!["6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P".to_string()],
        }
    }

    #[test]
    fn token_delta_is_post_minus_pre_in_ui_units() {
        let mut tx = base_tx();
        tx.pre_token_balances = vec![balance("walletA", "MintM", 0, 6)];
        tx.post_token_balances = vec![balance("walletA", "MintM", 100_000_000, 6)];

        let deltas = DeltaExtractor::extract(&tx);
        let delta = deltas.token_deltas[&("walletA".to_string(), "MintM".to_string())];
        assert!((delta - 100.0).abs() < 1e-9);
        assert_eq!(deltas.mints_touched, vec!["MintM".to_string()]);
    }

    #[test]
    fn fee_is_not_counted_as_quote_for_the_fee_payer() {
        let deltas = DeltaExtractor::extract(&base_tx());
        // 1.0 -> 0.499995 SOL with a 5000-lamport fee added back = -0.5 exactly.
        let native = deltas.native_deltas["walletA"];
        assert!((native + 0.5).abs() < 1e-9, "native delta {native}");
    }

    #[test]
    fn wrapped_native_balance_folds_into_native_delta() {
        let mut tx = base_tx();
        tx.pre_lamports = vec![1_000_000_000, 0];
        tx.post_lamports = vec![999_995_000, 0];
        tx.pre_token_balances = vec![balance("walletA", NATIVE_MINT, 500_000_000, 9)];
        tx.post_token_balances = vec![balance("walletA", NATIVE_MINT, 0, 9)];

        let deltas = DeltaExtractor::extract(&tx);
        assert!(deltas.token_deltas.is_empty());
        let native = deltas.native_deltas["walletA"];
        assert!((native + 0.5).abs() < 1e-9, "wsol unwrap folds in: {native}");
    }

    #[test]
    fn pure_rent_exempt_account_creation_is_excluded() {
        let mut tx = base_tx();
        tx.account_keys = vec!["walletA".to_string(), "freshAta".to_string()];
        tx.pre_lamports = vec![1_000_000_000, 0];
        tx.post_lamports = vec![997_955_720, ATA_RENT_LAMPORTS];

        let deltas = DeltaExtractor::extract(&tx);
        assert!(!deltas.native_deltas.contains_key("freshAta"));
    }

    #[test]
    fn venue_hint_prefers_first_recognized_program() {
        let mut tx = base_tx();
        tx.program_ids_touched = vec![
            "unknownProgram".to_string(),
            "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8".to_string(),
        ];
        let deltas = DeltaExtractor::extract(&tx);
        assert_eq!(deltas.venue_hint, Some("raydium"));

        tx.program_ids_touched = vec!["unknownProgram".to_string()];
        let deltas = DeltaExtractor::extract(&tx);
        assert_eq!(deltas.venue_hint, None);
    }

    #[test]
    fn missing_pre_and_post_entries_default_to_zero() {
        let mut tx = base_tx();
        tx.post_token_balances = vec![balance("walletB", "MintX", 42_000_000_000, 9)];
        let deltas = DeltaExtractor::extract(&tx);
        let delta = deltas.token_deltas[&("walletB".to_string(), "MintX".to_string())];
        assert!((delta - 42.0).abs() < 1e-9);
    }
}
