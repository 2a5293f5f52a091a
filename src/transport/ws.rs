//! WebSocket endpoint for the runner fleet.
//!
//! Runners connect, authenticate with a `hello` frame (constant-time
//! secret check against the stored hash), then exchange exec frames with
//! the dispatcher. Exec chunks stream into the worker output buffer and
//! onto the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ErrorKind;
use crate::events::{EventBus, EventType};
use crate::models::{RunnerJobStatus, RunnerStatus};
use crate::tools::envelope_error;
use crate::transport::dispatcher::job_result_from_row;
use crate::transport::output_buffer::EVENT_CHUNK_BYTES;
use crate::transport::{
    RunnerConnectionManager, RunnerJobDispatcher, RunnerMessage, ServerMessage, StdStream,
    WorkerOutputBuffer,
};

const HELLO_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// SHA-256 hex digest used for runner secrets, trigger secrets and device
/// tokens alike.
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Generate a cryptographically random secret (32 bytes, hex-encoded =
/// 64 chars). Shown to the caller exactly once; only the hash is stored.
pub fn generate_secret() -> String {
    use rand::Rng;

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time comparison of a presented secret against a stored hash.
pub fn verify_secret(secret: &str, stored_hash: &str) -> bool {
    let presented = hash_secret(secret);
    presented.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Everything the socket loop needs.
#[derive(Clone)]
pub struct RunnerSocketState {
    pub db: Arc<dyn Database>,
    pub connections: Arc<RunnerConnectionManager>,
    pub dispatcher: Arc<RunnerJobDispatcher>,
    pub output_buffer: Arc<WorkerOutputBuffer>,
    pub bus: Arc<EventBus>,
}

pub async fn runner_ws_handler(
    State(state): State<RunnerSocketState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(state, socket))
}

/// Drive one runner socket to completion.
pub async fn serve_socket(state: RunnerSocketState, socket: WebSocket) {
    if let Err(e) = runner_socket(state, socket).await {
        // Transport-level failures never propagate to a response path.
        tracing::debug!("runner socket closed: {}", e);
    }
}

async fn runner_socket(state: RunnerSocketState, socket: WebSocket) -> Result<(), String> {
    let (mut sink, mut stream) = socket.split();

    // First frame must be hello, promptly.
    let hello = tokio::time::timeout(HELLO_DEADLINE, stream.next())
        .await
        .map_err(|_| "hello deadline passed".to_string())?
        .ok_or("socket closed before hello")?
        .map_err(|e| e.to_string())?;
    let (runner_id, secret) = match parse_frame(&hello)? {
        Some(RunnerMessage::Hello { runner_id, secret }) => (runner_id, secret),
        _ => return Err("expected hello frame".to_string()),
    };

    let runner = state
        .db
        .get_runner(runner_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or("unknown runner")?;
    if !verify_secret(&secret, &runner.auth_secret_hash) {
        tracing::warn!(runner_id, "runner auth failed");
        let _ = sink.close().await;
        return Err("auth failed".to_string());
    }

    state
        .db
        .set_runner_status(runner_id, RunnerStatus::Online, Some(Utc::now()))
        .await
        .map_err(|e| e.to_string())?;

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    state.connections.register(runner_id, tx);
    tracing::info!(runner_id, name = %runner.name, "runner connected");

    // Writer: forwards dispatcher frames and keeps the ping cadence.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            let frame = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = ping.tick() => ServerMessage::Ping,
            };
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    state
        .connections
        .send_to_runner(runner_id, ServerMessage::HelloOk);

    // Reader: job lifecycle frames from the runner.
    let mut job_meta: HashMap<Uuid, JobMeta> = HashMap::new();
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(runner_id, "runner socket error: {}", e);
                break;
            }
        };
        if matches!(frame, Message::Close(_)) {
            break;
        }
        let parsed = match parse_frame(&frame) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(runner_id, "bad runner frame: {}", e);
                continue;
            }
        };

        match parsed {
            RunnerMessage::Hello { .. } => {
                tracing::debug!(runner_id, "duplicate hello ignored");
            }
            RunnerMessage::Pong => {
                let _ = state
                    .db
                    .set_runner_status(runner_id, RunnerStatus::Online, Some(Utc::now()))
                    .await;
            }
            RunnerMessage::ExecChunk {
                job_id,
                stream: std_stream,
                data,
            } => {
                handle_exec_chunk(&state, &mut job_meta, job_id, std_stream, &data).await;
            }
            RunnerMessage::ExecDone { job_id, exit_code } => {
                let _ = state
                    .db
                    .update_runner_job_status(job_id, RunnerJobStatus::Success, Some(exit_code))
                    .await;
                if let Ok(Some(row)) = state.db.get_runner_job(job_id).await {
                    state
                        .dispatcher
                        .complete_job(job_id, job_result_from_row(&row), Some(runner_id));
                }
                job_meta.remove(&job_id);
            }
            RunnerMessage::ExecError { job_id, error } => {
                let _ = state
                    .db
                    .update_runner_job_status(job_id, RunnerJobStatus::Failed, None)
                    .await;
                state.dispatcher.complete_job(
                    job_id,
                    envelope_error(
                        ErrorKind::ExecutionError,
                        &error,
                        serde_json::json!({"job_id": job_id}),
                    ),
                    Some(runner_id),
                );
                job_meta.remove(&job_id);
            }
        }
    }

    // Socket gone: take the runner offline and fail any in-flight job.
    state.connections.unregister(runner_id);
    let _ = state
        .db
        .set_runner_status(runner_id, RunnerStatus::Offline, None)
        .await;
    if let Some(job_id) = state.dispatcher.active_job(runner_id) {
        let _ = state
            .db
            .update_runner_job_status(job_id, RunnerJobStatus::Failed, None)
            .await;
        state.dispatcher.complete_job(
            job_id,
            envelope_error(
                ErrorKind::ExecutionError,
                "Runner disconnected during job",
                serde_json::Value::Null,
            ),
            Some(runner_id),
        );
    }
    writer.abort();
    tracing::info!(runner_id, "runner disconnected");
    Ok(())
}

struct JobMeta {
    worker_id: Option<String>,
    course_id: Option<i64>,
    owner_id: i64,
}

async fn handle_exec_chunk(
    state: &RunnerSocketState,
    job_meta: &mut HashMap<Uuid, JobMeta>,
    job_id: Uuid,
    std_stream: StdStream,
    data: &str,
) {
    let _ = state
        .db
        .append_runner_job_output(job_id, std_stream.as_str(), data)
        .await;

    if !job_meta.contains_key(&job_id) {
        if let Ok(Some(row)) = state.db.get_runner_job(job_id).await {
            job_meta.insert(
                job_id,
                JobMeta {
                    worker_id: row.worker_id,
                    course_id: row.course_id,
                    owner_id: row.owner_id,
                },
            );
        }
    }
    let Some(meta) = job_meta.get(&job_id) else {
        return;
    };

    if let Some(worker_id) = &meta.worker_id {
        state.output_buffer.append_output(
            worker_id,
            std_stream.as_str(),
            data,
            Some(job_id),
            None,
            meta.course_id,
            None,
            Some(meta.owner_id),
        );
    }

    let truncated = if data.len() > EVENT_CHUNK_BYTES {
        let boundary = (EVENT_CHUNK_BYTES..data.len())
            .find(|i| data.is_char_boundary(*i))
            .unwrap_or(data.len());
        &data[..boundary]
    } else {
        data
    };
    state
        .bus
        .publish(
            EventType::WorkerOutputChunk,
            serde_json::json!({
                "event_type": EventType::WorkerOutputChunk.as_str(),
                "runner_job_id": job_id,
                "worker_id": meta.worker_id,
                "course_id": meta.course_id,
                "stream": std_stream.as_str(),
                "data": truncated,
            }),
        )
        .await;
}

fn parse_frame(message: &Message) -> Result<Option<RunnerMessage>, String> {
    match message {
        Message::Text(text) => serde_json::from_str(text.as_str())
            .map(Some)
            .map_err(|e| e.to_string()),
        Message::Binary(_) => Err("binary frames unsupported".to_string()),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_hash_round_trip() {
        let hash = hash_secret("runner-secret");
        assert_eq!(hash.len(), 64);
        assert!(verify_secret("runner-secret", &hash));
        assert!(!verify_secret("wrong", &hash));
    }

    #[test]
    fn generated_secrets_are_random() {
        let first = generate_secret();
        let second = generate_secret();
        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
        assert!(verify_secret(&first, &hash_secret(&first)));
    }

    #[test]
    fn hello_frame_parses_from_text() {
        let frame = Message::Text(r#"{"type":"hello","runner_id":1,"secret":"s"}"#.into());
        let parsed = parse_frame(&frame).unwrap().unwrap();
        assert!(matches!(parsed, RunnerMessage::Hello { runner_id: 1, .. }));
    }

    #[test]
    fn ping_frames_are_ignored() {
        let frame = Message::Ping(Vec::new().into());
        assert!(parse_frame(&frame).unwrap().is_none());
    }
}
