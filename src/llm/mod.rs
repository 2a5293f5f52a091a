//! Model-invocation contract.
//!
//! Real provider clients live outside this repo; everything in-process
//! speaks `LlmProvider`. The scripted provider replays canned turns and is
//! what the orchestration tests (and `--memory-db` dev runs) use.

mod chat_api;
mod provider;
mod scripted;

pub use chat_api::ChatApiProvider;
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse, ToolDefinition,
};
pub use scripted::{ScriptedLlm, ScriptedTurn};
