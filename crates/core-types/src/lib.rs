use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wrapped-native mint; token balances against it are folded into the
/// owner's native delta before inference.
pub const NATIVE_MINT: &str = "So11111111111111111111111111111111111111112";
pub const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBalanceEntry {
    pub owner: String,
    pub mint: String,
    pub raw_amount: u64,
    pub decimals: u8,
}

/// Immutable record relayed from the upstream subscription into the durable
/// stream. `ingest_time` is stamped at relay time and doubles as the lag and
/// bucketing clock whenever `block_time` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTransaction {
    pub signature: String,
    pub slot: u64,
    pub ingest_time: DateTime<Utc>,
    pub block_time: Option<i64>,
    pub fee: u64,
    pub account_keys: Vec<String>,
    pub pre_token_balances: Vec<TokenBalanceEntry>,
    pub post_token_balances: Vec<TokenBalanceEntry>,
    pub pre_lamports: Vec<u64>,
    pub post_lamports: Vec<u64>,
    pub program_ids_touched: Vec<String>,
}

impl RawTransaction {
    pub fn fee_payer(&self) -> &str {
        self.account_keys.first().map(String::as_str).unwrap_or("")
    }

    /// Clock used for lag measurement and window bucketing.
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.block_time
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .unwrap_or(self.ingest_time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwapSide {
    Buy,
    Sell,
}

impl SwapSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapSide::Buy => "buy",
            SwapSide::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapEvent {
    pub signature: String,
    pub slot: u64,
    pub side: SwapSide,
    pub base_mint: String,
    pub quote_mint: String,
    pub base_amount: f64,
    pub quote_amount: f64,
    pub wallet: String,
    pub venue: String,
    pub confidence: f64,
    pub mcap_at_swap: Option<f64>,
    pub ts_utc: DateTime<Utc>,
}

/// Lightweight record emitted for every transaction that touched a mint,
/// including those below the swap-confidence floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintTouchEvent {
    pub signature: String,
    pub slot: u64,
    pub fee_payer: String,
    pub mints_touched: Vec<String>,
    pub ts_utc: DateTime<Utc>,
}

/// Compact per-transaction delta summary persisted to the delta log so HOT
/// promotion can replay recent activity without the raw stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxDeltaRecord {
    pub signature: String,
    pub slot: u64,
    pub ts_unix: i64,
    pub fee_payer: String,
    pub token_deltas: Vec<(String, String, f64)>,
    pub native_deltas: Vec<(String, f64)>,
    pub mints_touched: Vec<String>,
    pub program_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenState {
    Cold,
    Warm,
    Hot,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Cold => "COLD",
            TokenState::Warm => "WARM",
            TokenState::Hot => "HOT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenProfile {
    pub mint: String,
    pub state: TokenState,
    pub first_seen: DateTime<Utc>,
    pub state_since: DateTime<Utc>,
    pub hot_ttl_expires_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub last_alert_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletProfile {
    pub address: String,
    pub first_seen: DateTime<Utc>,
    pub funded_by: Option<String>,
    pub cluster_id: String,
}

/// Process-wide degradation mode published by the backpressure controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Degraded,
    Critical,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Degraded => "degraded",
            Mode::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

impl CompareOp {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Ge => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Le => lhs <= rhs,
            CompareOp::Eq => lhs == rhs,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
        }
    }
}

/// Wire form of a single rule condition, e.g. `buy_count_5m >= 10`. The
/// evaluator compiles `field` into a typed id at load time and rejects the
/// whole rule list on any unknown field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: CompareOp,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRule {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub conditions: Vec<Predicate>,
}

fn default_true() -> bool {
    true
}

/// Per-window rolling aggregates as read back from the counter store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub buy_count: u64,
    pub sell_count: u64,
    pub unique_buyers: u64,
    pub unique_sellers: u64,
    pub buy_volume_sol: f64,
    pub sell_volume_sol: f64,
    pub avg_buy_size: f64,
    pub buy_sell_ratio: f64,
    pub top_buyers: Vec<(String, f64)>,
    pub top_3_buyers_volume_share: f64,
    pub new_wallet_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MintSnapshot {
    pub mint: String,
    pub stats_5m: WindowStats,
    pub stats_1h: WindowStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CtoScore {
    pub total: f64,
    pub cluster: f64,
    pub concentration: f64,
    pub timing: f64,
    pub new_wallet: f64,
    pub ratio: f64,
    pub cluster_timed_out: bool,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: String,
    pub size: usize,
    pub volume_sol: f64,
}

/// Outbound alert payload; formatted once per trigger fire and fanned out to
/// every enabled channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub mint: String,
    pub token_symbol: Option<String>,
    pub token_name: Option<String>,
    pub token_image: Option<String>,
    pub trigger_name: String,
    pub trigger_reason: String,
    pub venue: Option<String>,
    pub volume_sol_5m: f64,
    pub buy_count_5m: u64,
    pub sell_count_5m: u64,
    pub unique_buyers_5m: u64,
    /// +inf serializes as `RATIO_INF_SENTINEL` so JSON consumers get a
    /// comparable large number instead of `null`.
    pub buy_sell_ratio_5m: f64,
    pub mcap_sol: Option<f64>,
    pub avg_entry_mcap: Option<f64>,
    pub cto_score: f64,
    pub cto_components: CtoScore,
    pub top_buyers: Vec<(String, f64)>,
    pub clusters: Vec<ClusterSummary>,
    pub enrichment_degraded: bool,
    pub created_at: DateTime<Utc>,
}

/// JSON stand-in for an infinite buy/sell ratio in alert payloads.
pub const RATIO_INF_SENTINEL: f64 = 1.0e9;

pub fn ratio_for_wire(ratio: f64) -> f64 {
    if ratio.is_infinite() {
        RATIO_INF_SENTINEL
    } else {
        ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_time_prefers_block_time() {
        let ingest = Utc::now();
        let tx = RawTransaction {
            signature: "sig".to_string(),
            slot: 1,
            ingest_time: ingest,
            block_time: Some(1_700_000_000),
            fee: 5_000,
            account_keys: vec!["payer".to_string()],
            pre_token_balances: vec![],
            post_token_balances: vec![],
            pre_lamports: vec![],
            post_lamports: vec![],
            program_ids_touched: vec![],
        };
        assert_eq!(tx.effective_time().timestamp(), 1_700_000_000);

        let tx = RawTransaction {
            block_time: None,
            ..tx
        };
        assert_eq!(tx.effective_time(), ingest);
    }

    #[test]
    fn compare_op_handles_infinity_against_finite_literals() {
        assert!(CompareOp::Ge.apply(f64::INFINITY, 10.0));
        assert!(CompareOp::Gt.apply(f64::INFINITY, 1e300));
        assert!(!CompareOp::Lt.apply(f64::INFINITY, 10.0));
    }

    #[test]
    fn ratio_wire_sentinel_replaces_infinity() {
        assert_eq!(ratio_for_wire(f64::INFINITY), RATIO_INF_SENTINEL);
        assert_eq!(ratio_for_wire(2.5), 2.5);
    }

    #[test]
    fn predicate_wire_format_round_trips_operators() {
        let rule: TriggerRule = serde_json::from_str(
            r#"{
                "name": "extreme_ratio",
                "conditions": [
                    {"field": "buy_count_5m", "op": ">=", "value": 10},
                    {"field": "sell_count_5m", "op": "==", "value": 0}
                ]
            }"#,
        )
        .expect("rule parses");
        assert!(rule.enabled, "enabled defaults to true");
        assert_eq!(rule.conditions[0].op, CompareOp::Ge);
        assert_eq!(rule.conditions[1].op, CompareOp::Eq);
    }
}
