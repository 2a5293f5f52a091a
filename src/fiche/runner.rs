//! The fiche runner.
//!
//! Executes one step of a fiche over a thread: load unprocessed input plus
//! a window of history, bind the allowed tool set, then loop the LLM until
//! it stops asking for tools or a tool raises an interrupt. Tool failures
//! become error envelopes the LLM can react to; infrastructure failures
//! propagate. An interrupt leaves the thread fully persisted so a later
//! continuation re-enters with nothing in memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::checkpoint::Checkpointer;
use crate::context::ExecutionContext;
use crate::db::Database;
use crate::error::{DatabaseError, LlmError};
use crate::llm::{ChatMessage, LlmProvider, Role, ToolCompletionRequest};
use crate::models::{MessageRole, NewThreadMessage, ThreadMessage, ToolCallRecord};
use crate::tools::{Interrupt, ToolRegistry};

const MAX_ITERATIONS: usize = 20;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum FicheRunError {
    /// The run suspended on a barrier; nothing is terminal.
    #[error("fiche run interrupted: {0:?}")]
    Interrupted(Interrupt),

    #[error("run cancelled")]
    Cancelled,

    #[error("tool loop exceeded {0} iterations")]
    LoopExceeded(usize),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// What a completed (non-interrupted) step produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub new_messages: Vec<ThreadMessage>,
    pub total_tokens: i64,
    pub total_cost_usd: Decimal,
}

impl RunOutcome {
    /// The terminal assistant text of this step, if any.
    pub fn final_text(&self) -> Option<&str> {
        self.new_messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant && !m.content.is_empty())
            .map(|m| m.content.as_str())
    }
}

pub struct FicheRunner {
    registry: Arc<ToolRegistry>,
    llm: Arc<dyn LlmProvider>,
    checkpointer: Arc<dyn Checkpointer>,
    /// Processed-history messages included ahead of the unprocessed input.
    history_window: usize,
    /// Feature flag: forward per-token callbacks to the emitter.
    token_stream: bool,
}

impl FicheRunner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmProvider>,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Self {
        Self {
            registry,
            llm,
            checkpointer,
            history_window: 40,
            token_stream: false,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    pub fn with_token_stream(mut self, enabled: bool) -> Self {
        self.token_stream = enabled;
        self
    }

    /// Run one step of the thread's fiche.
    pub async fn run_thread(
        &self,
        ctx: &ExecutionContext,
        thread_id: i64,
    ) -> Result<RunOutcome, FicheRunError> {
        let thread = ctx
            .db
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("thread {thread_id}")))?;
        let fiche = ctx
            .db
            .get_fiche(thread.fiche_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("fiche {}", thread.fiche_id)))?;

        let all_messages = ctx.db.list_messages(thread_id).await?;
        let (history, unprocessed): (Vec<_>, Vec<_>) =
            all_messages.into_iter().partition(|m| m.processed);
        let unprocessed_ids: Vec<i64> = unprocessed.iter().map(|m| m.id).collect();

        let mut conversation: Vec<ChatMessage> = Vec::new();
        let instructions = [
            fiche.system_instructions.trim(),
            fiche.task_instructions.trim(),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n");
        if !instructions.is_empty() {
            conversation.push(ChatMessage::system(instructions));
        }
        let history_start = history.len().saturating_sub(self.history_window);
        for message in &history[history_start..] {
            conversation.push(to_chat_message(message));
        }
        for message in &unprocessed {
            conversation.push(to_chat_message(message));
        }

        let definitions = self.registry.definitions(&fiche.allowed_tools);

        let prior_iterations = self
            .checkpointer
            .load(thread_id)
            .await?
            .and_then(|s| s.get("iterations").and_then(|v| v.as_u64()))
            .unwrap_or(0);

        let mut new_messages: Vec<ThreadMessage> = Vec::new();
        let mut total_tokens: i64 = 0;
        let mut total_cost = Decimal::ZERO;
        let (input_rate, output_rate) = self.llm.cost_per_token();

        for iteration in 0..MAX_ITERATIONS {
            if ctx.cancel.is_cancelled() {
                return Err(FicheRunError::Cancelled);
            }

            let response = self
                .invoke_llm(ctx, conversation.clone(), definitions.clone())
                .await?;

            total_tokens += (response.input_tokens + response.output_tokens) as i64;
            total_cost += Decimal::from(response.input_tokens) * input_rate
                + Decimal::from(response.output_tokens) * output_rate;

            let assistant_text = response.content.clone().unwrap_or_default();
            // The emitter's stable UUID tags the terminal assistant message
            // so token and completion events correlate.
            let message_uuid = ctx
                .emitter
                .as_ref()
                .map(|e| e.message_id)
                .filter(|_| response.tool_calls.is_empty())
                .unwrap_or_else(Uuid::new_v4);

            if response.tool_calls.is_empty() {
                // Terminal assistant turn.
                let saved = ctx
                    .db
                    .append_message(&NewThreadMessage::assistant(
                        thread_id,
                        assistant_text,
                        message_uuid,
                    ))
                    .await?;
                new_messages.push(saved);
                ctx.db.mark_messages_processed(&unprocessed_ids).await?;
                self.checkpointer
                    .save(
                        thread_id,
                        &serde_json::json!({
                            "iterations": prior_iterations + iteration as u64 + 1,
                            "last_message_id": message_uuid,
                        }),
                    )
                    .await?;
                return Ok(RunOutcome {
                    new_messages,
                    total_tokens,
                    total_cost_usd: total_cost,
                });
            }

            // Assistant turn with tool calls: persist it, dispatch, then
            // feed results back.
            let tool_call_records: Vec<ToolCallRecord> = response
                .tool_calls
                .iter()
                .map(|c| ToolCallRecord {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    args: c.args.clone(),
                })
                .collect();
            let saved = ctx
                .db
                .append_message(&NewThreadMessage {
                    thread_id,
                    role: MessageRole::Assistant,
                    content: assistant_text.clone(),
                    message_uuid: Some(message_uuid),
                    tool_calls: tool_call_records.clone(),
                    tool_call_id: None,
                    processed: true,
                })
                .await?;
            new_messages.push(saved);
            conversation.push(ChatMessage {
                role: Role::Assistant,
                content: assistant_text,
                tool_calls: response.tool_calls.clone(),
                tool_call_id: None,
            });

            // Started events precede dispatch; execution itself may be
            // parallel and results are gathered before the loop proceeds.
            for call in &response.tool_calls {
                if let Some(emitter) = &ctx.emitter {
                    emitter.emit_tool_started(&call.name, &call.id, &call.args).await;
                }
            }

            let dispatches = response.tool_calls.iter().map(|call| self.dispatch(ctx, call));
            let results = futures::future::join_all(dispatches).await;

            let mut pending_interrupt: Option<Interrupt> = None;
            for (call, outcome) in response.tool_calls.iter().zip(results) {
                match outcome {
                    DispatchOutcome::Success {
                        result,
                        interrupt,
                        duration_ms,
                    } => {
                        if let Some(emitter) = &ctx.emitter {
                            emitter
                                .emit_tool_completed(&call.name, &call.id, duration_ms, &result)
                                .await;
                        }
                        if let Some(interrupt) = interrupt {
                            merge_interrupt(&mut pending_interrupt, interrupt);
                            // No tool message: the worker summary arrives
                            // with the continuation instead.
                            continue;
                        }
                        let content = match &result {
                            serde_json::Value::String(text) => text.clone(),
                            other => other.to_string(),
                        };
                        let saved = ctx
                            .db
                            .append_message(&NewThreadMessage {
                                thread_id,
                                role: MessageRole::Tool,
                                content: content.clone(),
                                message_uuid: None,
                                tool_calls: Vec::new(),
                                tool_call_id: Some(call.id.clone()),
                                processed: true,
                            })
                            .await?;
                        new_messages.push(saved);
                        conversation.push(ChatMessage::tool(content, call.id.clone()));
                    }
                    DispatchOutcome::Envelope {
                        envelope,
                        error,
                        duration_ms,
                    } => {
                        if let Some(emitter) = &ctx.emitter {
                            emitter
                                .emit_tool_failed(&call.name, &call.id, duration_ms, &error)
                                .await;
                        }
                        let content = envelope.to_string();
                        let saved = ctx
                            .db
                            .append_message(&NewThreadMessage {
                                thread_id,
                                role: MessageRole::Tool,
                                content: content.clone(),
                                message_uuid: None,
                                tool_calls: Vec::new(),
                                tool_call_id: Some(call.id.clone()),
                                processed: true,
                            })
                            .await?;
                        new_messages.push(saved);
                        conversation.push(ChatMessage::tool(content, call.id.clone()));
                    }
                }
            }

            if let Some(interrupt) = pending_interrupt {
                ctx.db.mark_messages_processed(&unprocessed_ids).await?;
                self.checkpointer
                    .save(
                        thread_id,
                        &serde_json::json!({
                            "iterations": prior_iterations + iteration as u64 + 1,
                            "suspended": interrupt.kind,
                        }),
                    )
                    .await?;
                return Err(FicheRunError::Interrupted(interrupt));
            }
        }

        Err(FicheRunError::LoopExceeded(MAX_ITERATIONS))
    }

    /// One LLM call with heartbeat and optional token streaming attached.
    async fn invoke_llm(
        &self,
        ctx: &ExecutionContext,
        messages: Vec<ChatMessage>,
        tools: Vec<crate::llm::ToolDefinition>,
    ) -> Result<crate::llm::ToolCompletionResponse, LlmError> {
        let heartbeat = ctx.emitter.clone().map(|emitter| {
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
                tick.tick().await;
                loop {
                    tick.tick().await;
                    emitter.emit_heartbeat("thinking", "llm_call").await;
                }
            })
        });

        let (token_sink, token_pump) = if self.token_stream {
            match ctx.emitter.clone() {
                Some(emitter) => {
                    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
                    let pump = tokio::spawn(async move {
                        while let Some(token) = rx.recv().await {
                            emitter.emit_token(&token).await;
                        }
                    });
                    (Some(tx), Some(pump))
                }
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let result = self
            .llm
            .complete_with_tools(ToolCompletionRequest {
                messages,
                tools,
                max_tokens: None,
                temperature: None,
                token_sink,
            })
            .await;

        if let Some(handle) = heartbeat {
            handle.abort();
        }
        if let Some(pump) = token_pump {
            // Sink already dropped with the request; drain what's left.
            let _ = pump.await;
        }

        result
    }

    async fn dispatch(
        &self,
        ctx: &ExecutionContext,
        call: &crate::llm::ToolCall,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let Some(tool) = self.registry.get(&call.name) else {
            let error = format!("unknown tool: {}", call.name);
            return DispatchOutcome::Envelope {
                envelope: crate::tools::envelope_error(
                    crate::error::ErrorKind::NotFound,
                    &error,
                    serde_json::Value::Null,
                ),
                error,
                duration_ms: 0,
            };
        };

        match tool.execute(call.args.clone(), ctx).await {
            Ok(output) => DispatchOutcome::Success {
                result: output.result,
                interrupt: output.interrupt,
                duration_ms: started.elapsed().as_millis() as i64,
            },
            Err(e) => DispatchOutcome::Envelope {
                envelope: e.to_envelope(),
                error: e.to_string(),
                duration_ms: started.elapsed().as_millis() as i64,
            },
        }
    }
}

enum DispatchOutcome {
    Success {
        result: serde_json::Value,
        interrupt: Option<Interrupt>,
        duration_ms: i64,
    },
    Envelope {
        envelope: serde_json::Value,
        error: String,
        duration_ms: i64,
    },
}

fn merge_interrupt(slot: &mut Option<Interrupt>, incoming: Interrupt) {
    match slot {
        Some(existing) => {
            existing.job_ids.extend(incoming.job_ids);
            existing.created_jobs.extend(incoming.created_jobs);
        }
        None => *slot = Some(incoming),
    }
}

fn to_chat_message(message: &ThreadMessage) -> ChatMessage {
    ChatMessage {
        role: match message.role {
            MessageRole::System => Role::System,
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
            MessageRole::Tool => Role::Tool,
        },
        content: message.content.clone(),
        tool_calls: message
            .tool_calls
            .iter()
            .map(|c| crate::llm::ToolCall {
                id: c.id.clone(),
                name: c.name.clone(),
                args: c.args.clone(),
            })
            .collect(),
        tool_call_id: message.tool_call_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointer;
    use crate::context::ConciergeScope;
    use crate::credentials::StaticCredentials;
    use crate::db::{Database, MemoryDatabase};
    use crate::llm::{ScriptedLlm, ScriptedTurn, ToolCall};
    use crate::models::{CourseStatus, CourseTrigger, NewFiche, ThreadKind, UserRole};
    use crate::tools::builtin::{EchoTool, SpawnCommisTool};

    struct Fixture {
        db: Arc<MemoryDatabase>,
        thread_id: i64,
        course_id: i64,
        owner_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(MemoryDatabase::new());
        let user = db.create_user("o@x.y", None, UserRole::User).await.unwrap();
        let fiche = db
            .create_fiche(&NewFiche::basic(user.id, "helper", "gpt"))
            .await
            .unwrap();
        let thread = db
            .create_thread(fiche.id, user.id, "t", ThreadKind::Concierge)
            .await
            .unwrap();
        let course = db
            .create_course(
                fiche.id,
                thread.id,
                CourseTrigger::Api,
                CourseStatus::Running,
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        db.append_message(&NewThreadMessage::user(thread.id, "say hello"))
            .await
            .unwrap();
        Fixture {
            db,
            thread_id: thread.id,
            course_id: course.id,
            owner_id: user.id,
        }
    }

    fn runner_with(llm: ScriptedLlm) -> FicheRunner {
        let registry = Arc::new(
            ToolRegistry::builder()
                .register(Arc::new(EchoTool))
                .register(Arc::new(SpawnCommisTool))
                .build(),
        );
        FicheRunner::new(registry, Arc::new(llm), Arc::new(MemoryCheckpointer::new()))
    }

    fn ctx_for(fx: &Fixture) -> ExecutionContext {
        ExecutionContext::new(Arc::clone(&fx.db) as Arc<dyn Database>, fx.owner_id)
            .with_credentials(Arc::new(StaticCredentials::new()))
            .with_concierge(ConciergeScope {
                course_id: fx.course_id,
                trace_id: Uuid::new_v4(),
                model: "gpt".to_string(),
                reasoning_effort: None,
            })
    }

    #[tokio::test]
    async fn plain_text_turn_persists_assistant_and_marks_input_processed() {
        let fx = fixture().await;
        let runner = runner_with(ScriptedLlm::respond_with("hello there"));

        let outcome = runner.run_thread(&ctx_for(&fx), fx.thread_id).await.unwrap();
        assert_eq!(outcome.final_text(), Some("hello there"));

        let messages = fx.db.list_messages(fx.thread_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.processed));
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert!(messages[1].message_uuid.is_some());
    }

    #[tokio::test]
    async fn tool_call_round_trip_feeds_result_back() {
        let fx = fixture().await;
        let runner = runner_with(ScriptedLlm::new(vec![
            ScriptedTurn::ToolCalls(vec![ToolCall {
                id: "call_1".to_string(),
                name: "echo".to_string(),
                args: serde_json::json!({"message": "ping"}),
            }]),
            ScriptedTurn::Text("echoed: ping".to_string()),
        ]));

        let outcome = runner.run_thread(&ctx_for(&fx), fx.thread_id).await.unwrap();
        assert_eq!(outcome.final_text(), Some("echoed: ping"));

        let messages = fx.db.list_messages(fx.thread_id).await.unwrap();
        // user, assistant(tool_calls), tool, assistant
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].tool_calls.len(), 1);
        assert_eq!(messages[2].role, MessageRole::Tool);
        assert_eq!(messages[2].content, "ping");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn tool_error_becomes_envelope_and_loop_continues() {
        let fx = fixture().await;
        let runner = runner_with(ScriptedLlm::new(vec![
            ScriptedTurn::ToolCalls(vec![ToolCall {
                id: "call_1".to_string(),
                name: "echo".to_string(),
                args: serde_json::json!({}),
            }]),
            ScriptedTurn::Text("recovered".to_string()),
        ]));

        let outcome = runner.run_thread(&ctx_for(&fx), fx.thread_id).await.unwrap();
        assert_eq!(outcome.final_text(), Some("recovered"));

        let messages = fx.db.list_messages(fx.thread_id).await.unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&messages[2].content).unwrap();
        assert_eq!(envelope["ok"], false);
        assert_eq!(envelope["error_type"], "validation_error");
    }

    #[tokio::test]
    async fn unknown_tool_returns_not_found_envelope() {
        let fx = fixture().await;
        let runner = runner_with(ScriptedLlm::new(vec![
            ScriptedTurn::ToolCalls(vec![ToolCall {
                id: "call_1".to_string(),
                name: "no_such_tool".to_string(),
                args: serde_json::json!({}),
            }]),
            ScriptedTurn::Text("ok".to_string()),
        ]));

        runner.run_thread(&ctx_for(&fx), fx.thread_id).await.unwrap();
        let messages = fx.db.list_messages(fx.thread_id).await.unwrap();
        let envelope: serde_json::Value = serde_json::from_str(&messages[2].content).unwrap();
        assert_eq!(envelope["error_type"], "not_found");
    }

    #[tokio::test]
    async fn spawn_interrupt_suspends_without_tool_message() {
        let fx = fixture().await;
        let runner = runner_with(ScriptedLlm::new(vec![ScriptedTurn::ToolCalls(vec![
            ToolCall {
                id: "call_1".to_string(),
                name: "spawn_commis".to_string(),
                args: serde_json::json!({"task": "df -h on cube"}),
            },
        ])]));

        let err = runner
            .run_thread(&ctx_for(&fx), fx.thread_id)
            .await
            .unwrap_err();
        let FicheRunError::Interrupted(interrupt) = err else {
            panic!("expected interrupt, got {err:?}");
        };
        assert_eq!(interrupt.kind, "commiss_pending");
        assert_eq!(interrupt.job_ids.len(), 1);

        // The assistant tool-call message persisted, no tool message did,
        // and the user input is consumed.
        let messages = fx.db.list_messages(fx.thread_id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.processed));
        assert!(messages.iter().all(|m| m.role != MessageRole::Tool));
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_llm() {
        let fx = fixture().await;
        let runner = runner_with(ScriptedLlm::respond_with("never"));
        let ctx = ctx_for(&fx);
        ctx.cancel.cancel();

        let err = runner.run_thread(&ctx, fx.thread_id).await.unwrap_err();
        assert!(matches!(err, FicheRunError::Cancelled));
    }
}
