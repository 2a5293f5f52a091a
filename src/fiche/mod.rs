//! Fiche execution: one step of the LLM-plus-tools loop over a thread.

mod runner;

pub use runner::{FicheRunError, FicheRunner, RunOutcome};
