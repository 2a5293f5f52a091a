//! Wire frames for the runner control channel.
//!
//! Every frame is a JSON object with a `type` discriminator.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl StdStream {
    pub fn as_str(self) -> &'static str {
        match self {
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        }
    }
}

/// Frames the runner sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    /// First frame after connect; authenticates the socket.
    Hello { runner_id: i64, secret: String },
    ExecChunk {
        job_id: Uuid,
        stream: StdStream,
        data: String,
    },
    ExecDone { job_id: Uuid, exit_code: i32 },
    ExecError { job_id: Uuid, error: String },
    Pong,
}

/// Frames the server sends to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HelloOk,
    ExecRequest {
        job_id: Uuid,
        command: String,
        timeout_secs: i64,
    },
    Cancel { job_id: Uuid },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_type_discriminator() {
        let frame = serde_json::to_value(ServerMessage::ExecRequest {
            job_id: Uuid::nil(),
            command: "echo hi".to_string(),
            timeout_secs: 60,
        })
        .unwrap();
        assert_eq!(frame["type"], "exec_request");
        assert_eq!(frame["command"], "echo hi");
        assert_eq!(frame["timeout_secs"], 60);
    }

    #[test]
    fn exec_chunk_round_trips() {
        let json = r#"{"type":"exec_chunk","job_id":"00000000-0000-0000-0000-000000000000","stream":"stderr","data":"oops"}"#;
        let frame: RunnerMessage = serde_json::from_str(json).unwrap();
        match frame {
            RunnerMessage::ExecChunk { stream, data, .. } => {
                assert_eq!(stream, StdStream::Stderr);
                assert_eq!(data, "oops");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn hello_parses() {
        let json = r#"{"type":"hello","runner_id":3,"secret":"s"}"#;
        let frame: RunnerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(frame, RunnerMessage::Hello { runner_id: 3, .. }));
    }
}
