mod deltas;
mod inference;

pub use self::deltas::{
    is_known_venue_program, venue_for_program, DeltaExtractor, DeltaSet, ACCOUNT_RENT_LAMPORTS,
    ATA_RENT_LAMPORTS, VENUE_PROGRAMS,
};
pub use self::inference::{InferenceParams, SeenMintCache, SwapCandidate, SwapInferencer};
