use anyhow::{anyhow, Context, Result};
use mintwatch_core_types::{CompareOp, MintSnapshot, TriggerRule, WindowStats};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Typed aggregate fields a rule condition may reference. Unknown names are
/// rejected when the rule list loads, never at evaluation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldId {
    BuyCount5m,
    SellCount5m,
    UniqueBuyers5m,
    UniqueSellers5m,
    BuyVolumeSol5m,
    SellVolumeSol5m,
    AvgBuySize5m,
    BuySellRatio5m,
    Top3BuyersVolumeShare5m,
    NewWalletPct5m,
    BuyCount1h,
    SellCount1h,
    UniqueBuyers1h,
    UniqueSellers1h,
    BuyVolumeSol1h,
    SellVolumeSol1h,
    AvgBuySize1h,
    BuySellRatio1h,
    Top3BuyersVolumeShare1h,
    NewWalletPct1h,
}

impl FromStr for FieldId {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "buy_count_5m" => Ok(Self::BuyCount5m),
            "sell_count_5m" => Ok(Self::SellCount5m),
            "unique_buyers_5m" => Ok(Self::UniqueBuyers5m),
            "unique_sellers_5m" => Ok(Self::UniqueSellers5m),
            "buy_volume_sol_5m" => Ok(Self::BuyVolumeSol5m),
            "sell_volume_sol_5m" => Ok(Self::SellVolumeSol5m),
            "avg_buy_size_5m" => Ok(Self::AvgBuySize5m),
            "buy_sell_ratio_5m" => Ok(Self::BuySellRatio5m),
            "top_3_buyers_volume_share_5m" => Ok(Self::Top3BuyersVolumeShare5m),
            "new_wallet_pct_5m" => Ok(Self::NewWalletPct5m),
            "buy_count_1h" => Ok(Self::BuyCount1h),
            "sell_count_1h" => Ok(Self::SellCount1h),
            "unique_buyers_1h" => Ok(Self::UniqueBuyers1h),
            "unique_sellers_1h" => Ok(Self::UniqueSellers1h),
            "buy_volume_sol_1h" => Ok(Self::BuyVolumeSol1h),
            "sell_volume_sol_1h" => Ok(Self::SellVolumeSol1h),
            "avg_buy_size_1h" => Ok(Self::AvgBuySize1h),
            "buy_sell_ratio_1h" => Ok(Self::BuySellRatio1h),
            "top_3_buyers_volume_share_1h" => Ok(Self::Top3BuyersVolumeShare1h),
            "new_wallet_pct_1h" => Ok(Self::NewWalletPct1h),
            other => Err(anyhow!("unknown aggregate field: {other}")),
        }
    }
}

impl FieldId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BuyCount5m => "buy_count_5m",
            Self::SellCount5m => "sell_count_5m",
            Self::UniqueBuyers5m => "unique_buyers_5m",
            Self::UniqueSellers5m => "unique_sellers_5m",
            Self::BuyVolumeSol5m => "buy_volume_sol_5m",
            Self::SellVolumeSol5m => "sell_volume_sol_5m",
            Self::AvgBuySize5m => "avg_buy_size_5m",
            Self::BuySellRatio5m => "buy_sell_ratio_5m",
            Self::Top3BuyersVolumeShare5m => "top_3_buyers_volume_share_5m",
            Self::NewWalletPct5m => "new_wallet_pct_5m",
            Self::BuyCount1h => "buy_count_1h",
            Self::SellCount1h => "sell_count_1h",
            Self::UniqueBuyers1h => "unique_buyers_1h",
            Self::UniqueSellers1h => "unique_sellers_1h",
            Self::BuyVolumeSol1h => "buy_volume_sol_1h",
            Self::SellVolumeSol1h => "sell_volume_sol_1h",
            Self::AvgBuySize1h => "avg_buy_size_1h",
            Self::BuySellRatio1h => "buy_sell_ratio_1h",
            Self::Top3BuyersVolumeShare1h => "top_3_buyers_volume_share_1h",
            Self::NewWalletPct1h => "new_wallet_pct_1h",
        }
    }

    pub fn resolve(&self, snapshot: &MintSnapshot) -> f64 {
        fn pick(stats: &WindowStats, field: &FieldId) -> f64 {
            match field {
                FieldId::BuyCount5m | FieldId::BuyCount1h => stats.buy_count as f64,
                FieldId::SellCount5m | FieldId::SellCount1h => stats.sell_count as f64,
                FieldId::UniqueBuyers5m | FieldId::UniqueBuyers1h => stats.unique_buyers as f64,
                FieldId::UniqueSellers5m | FieldId::UniqueSellers1h => stats.unique_sellers as f64,
                FieldId::BuyVolumeSol5m | FieldId::BuyVolumeSol1h => stats.buy_volume_sol,
                FieldId::SellVolumeSol5m | FieldId::SellVolumeSol1h => stats.sell_volume_sol,
                FieldId::AvgBuySize5m | FieldId::AvgBuySize1h => stats.avg_buy_size,
                FieldId::BuySellRatio5m | FieldId::BuySellRatio1h => stats.buy_sell_ratio,
                FieldId::Top3BuyersVolumeShare5m | FieldId::Top3BuyersVolumeShare1h => {
                    stats.top_3_buyers_volume_share
                }
                FieldId::NewWalletPct5m | FieldId::NewWalletPct1h => stats.new_wallet_pct,
            }
        }
        if self.is_five_minute() {
            pick(&snapshot.stats_5m, self)
        } else {
            pick(&snapshot.stats_1h, self)
        }
    }

    fn is_five_minute(&self) -> bool {
        matches!(
            self,
            Self::BuyCount5m
                | Self::SellCount5m
                | Self::UniqueBuyers5m
                | Self::UniqueSellers5m
                | Self::BuyVolumeSol5m
                | Self::SellVolumeSol5m
                | Self::AvgBuySize5m
                | Self::BuySellRatio5m
                | Self::Top3BuyersVolumeShare5m
                | Self::NewWalletPct5m
        )
    }
}

#[derive(Debug, Clone)]
struct CompiledCondition {
    field: FieldId,
    op: CompareOp,
    value: f64,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    enabled: bool,
    conditions: Vec<CompiledCondition>,
}

#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Validation is all-or-nothing: one bad field or literal rejects the
    /// entire list so a broken reload can never shadow a working one.
    pub fn compile(rules: &[TriggerRule]) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.conditions.is_empty() {
                return Err(anyhow!("rule {} has no conditions", rule.name));
            }
            let mut conditions = Vec::with_capacity(rule.conditions.len());
            for predicate in &rule.conditions {
                if !predicate.value.is_finite() {
                    return Err(anyhow!(
                        "rule {} has a non-finite literal for {}",
                        rule.name,
                        predicate.field
                    ));
                }
                conditions.push(CompiledCondition {
                    field: predicate
                        .field
                        .parse()
                        .with_context(|| format!("rule {}", rule.name))?,
                    op: predicate.op,
                    value: predicate.value,
                });
            }
            compiled.push(CompiledRule {
                name: rule.name.clone(),
                enabled: rule.enabled,
                conditions,
            });
        }
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TriggerFire {
    pub rule_name: String,
    pub reason: String,
}

/// Evaluates enabled rules against a mint snapshot. The active rule set is
/// replaced atomically on hot reload; evaluation only ever observes a
/// complete list.
pub struct TriggerEvaluator {
    rules: RwLock<Arc<RuleSet>>,
}

impl TriggerEvaluator {
    pub fn new(initial: RuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn evaluate(&self, snapshot: &MintSnapshot) -> Option<TriggerFire> {
        let rules = self
            .rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for rule in &rules.rules {
            if !rule.enabled {
                continue;
            }
            if rule
                .conditions
                .iter()
                .all(|cond| cond.op.apply(cond.field.resolve(snapshot), cond.value))
            {
                return Some(TriggerFire {
                    rule_name: rule.name.clone(),
                    reason: format_reason(rule, snapshot),
                });
            }
        }
        None
    }

    /// Parses and swaps in a new rule list. A payload that fails validation
    /// leaves the active rules untouched.
    pub fn reload_from_json(&self, payload: &str) -> Result<usize> {
        let parsed: Vec<TriggerRule> =
            serde_json::from_str(payload).context("trigger payload is not valid JSON")?;
        let compiled = RuleSet::compile(&parsed)?;
        let count = compiled.len();
        let mut guard = self
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(compiled);
        info!(rules = count, "trigger rules replaced");
        Ok(count)
    }

    pub fn try_reload_from_json(&self, payload: &str) -> bool {
        match self.reload_from_json(payload) {
            Ok(_) => true,
            Err(error) => {
                warn!(error = %error, "trigger reload rejected, keeping active rules");
                false
            }
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn format_reason(rule: &CompiledRule, snapshot: &MintSnapshot) -> String {
    let mut parts = vec![format!("Trigger: {}", rule.name)];
    for cond in &rule.conditions {
        let actual = cond.field.resolve(snapshot);
        parts.push(format!(
            "{}={:.2} ({} {})",
            cond.field.name(),
            actual,
            cond.op.as_str(),
            cond.value
        ));
    }
    parts.join(" | ")
}
