mod client;
mod clustering;
mod scoring;

pub use self::client::{
    estimate_mcap_sol, CircuitBreaker, CreditBudget, EnrichmentClient, FundingInfo, TokenMetadata,
    TokenSupply,
};
pub use self::clustering::WalletClusterer;
pub use self::scoring::{burstiness, score_components, ScoreService};
