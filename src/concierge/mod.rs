//! Concierge orchestration: the long-lived interactive fiche, its
//! deferred-turn machinery, and the barrier joining commis completions.

mod barrier;
mod service;

pub use barrier::{BarrierManager, ContinuationReady};
pub use service::{COMMIS_JOB_ID, ConciergeOptions, ConciergeResult, ConciergeService};
