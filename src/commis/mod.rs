//! Commis execution: short-lived subordinate fiches run off the durable
//! queue, reporting back to the concierge through the barrier.

mod runner;

pub use runner::CommisRunner;
