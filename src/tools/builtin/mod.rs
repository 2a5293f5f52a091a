//! Builtin tools available to fiches.

mod commis;
mod echo;
mod http;
mod runner;

pub use commis::SpawnCommisTool;
pub use echo::EchoTool;
pub use http::HttpRequestTool;
pub use runner::{PeekWorkerOutputTool, RunnerExecTool};

use std::sync::Arc;

use crate::tools::ToolRegistry;

/// The standard registry: every builtin, built once at startup.
pub fn default_registry() -> ToolRegistry {
    ToolRegistry::builder()
        .register(Arc::new(EchoTool))
        .register(Arc::new(HttpRequestTool::new()))
        .register(Arc::new(SpawnCommisTool))
        .register(Arc::new(RunnerExecTool))
        .register(Arc::new(PeekWorkerOutputTool))
        .build()
}
