//! Deterministic provider replaying a fixed script of turns.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmProvider, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse,
};

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Terminal assistant text.
    Text(String),
    /// Assistant turn requesting tool calls.
    ToolCalls(Vec<ToolCall>),
}

/// Replays turns in order; used wherever a real model would run.
pub struct ScriptedLlm {
    model: String,
    turns: Mutex<VecDeque<ScriptedTurn>>,
    consumed: Mutex<usize>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            model: "scripted".to_string(),
            turns: Mutex::new(turns.into()),
            consumed: Mutex::new(0),
        }
    }

    /// Single-turn script that answers every thread with `text`.
    pub fn respond_with(text: impl Into<String>) -> Self {
        Self::new(vec![ScriptedTurn::Text(text.into())])
    }

    fn next_turn(&self) -> Result<ScriptedTurn, LlmError> {
        let mut turns = self.turns.lock().expect("script lock");
        let mut consumed = self.consumed.lock().expect("script lock");
        match turns.pop_front() {
            Some(turn) => {
                *consumed += 1;
                Ok(turn)
            }
            None => Err(LlmError::ScriptExhausted(*consumed)),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match self.next_turn()? {
            ScriptedTurn::Text(text) => Ok(CompletionResponse {
                output_tokens: text.split_whitespace().count() as u64,
                content: text,
                input_tokens: 0,
                finish_reason: FinishReason::Stop,
            }),
            ScriptedTurn::ToolCalls(_) => Err(LlmError::MalformedResponse(
                "script expected a text turn for plain completion".to_string(),
            )),
        }
    }

    async fn complete_with_tools(
        &self,
        req: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        match self.next_turn()? {
            ScriptedTurn::Text(text) => {
                if let Some(sink) = &req.token_sink {
                    for token in text.split_inclusive(' ') {
                        let _ = sink.send(token.to_string());
                    }
                }
                Ok(ToolCompletionResponse {
                    output_tokens: text.split_whitespace().count() as u64,
                    content: Some(text),
                    tool_calls: Vec::new(),
                    input_tokens: req.messages.len() as u64,
                    finish_reason: FinishReason::Stop,
                })
            }
            ScriptedTurn::ToolCalls(calls) => Ok(ToolCompletionResponse {
                content: None,
                tool_calls: calls,
                input_tokens: req.messages.len() as u64,
                output_tokens: 0,
                finish_reason: FinishReason::ToolUse,
            }),
        }
    }
}
