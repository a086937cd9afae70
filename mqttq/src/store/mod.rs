//! In-flight state: identifiers we own and identifiers the peer owns.

pub mod dedup;
pub mod ids;

pub use dedup::DedupStore;
pub use ids::{
    AckFuture, AckOutcome, Allocation, AckPayload, AckStage, EntryState, IdentifierStore, Phase, ResendScan,
    Status,
};
