//! Tool contract, immutable registry, and builtin tools.

pub mod builtin;
mod registry;
mod tool;

pub use registry::ToolRegistry;
pub use tool::{
    Interrupt, Tool, ToolError, ToolOutput, envelope_error, envelope_is_critical,
    envelope_is_error, envelope_ok,
};
