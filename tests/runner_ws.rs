//! Runner control-plane flow over a real WebSocket: hello auth, exec
//! dispatch, streamed chunks, completion, and live-output fan-out.

mod common;

use std::sync::Arc;

use brigade::db::Database;
use brigade::models::RunnerStatus;
use brigade::transport::ws::hash_secret;
use common::Harness;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const RUNNER_SECRET: &str = "runner-secret";

async fn start_server(harness: &Harness) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = harness.router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("ws://{addr}/runners/ws")
}

fn frame(value: serde_json::Value) -> Message {
    Message::Text(value.to_string().into())
}

async fn next_json(
    socket: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
          + Unpin),
) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .expect("frame deadline")
            .expect("socket open")
            .expect("frame ok");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn full_exec_round_trip() {
    let harness = Harness::new(vec![]);
    let user = harness.user("owner@example.com").await;
    let runner = harness
        .db
        .create_runner(user.id, "cube", &hash_secret(RUNNER_SECRET))
        .await
        .unwrap();

    let url = start_server(&harness).await;
    let (socket, _) = connect_async(&url).await.unwrap();
    let (mut sink, mut stream) = socket.split();

    // Authenticate.
    sink.send(frame(serde_json::json!({
        "type": "hello",
        "runner_id": runner.id,
        "secret": RUNNER_SECRET,
    })))
    .await
    .unwrap();
    let hello_ok = next_json(&mut stream).await;
    assert_eq!(hello_ok["type"], "hello_ok");

    // Runner is online once the hello lands.
    let db = Arc::clone(&harness.db);
    let runner_id = runner.id;
    harness
        .wait_until(|| {
            let db = Arc::clone(&db);
            async move {
                db.get_runner(runner_id).await.unwrap().unwrap().status == RunnerStatus::Online
            }
        })
        .await;
    assert!(harness.connections.is_online(runner.id));

    // Watch for the live output event.
    let mut bus_stream = Box::pin(harness.bus.subscribe_stream());

    // Dispatch from the server side while the client plays runner.
    let dispatcher = Arc::clone(&harness.dispatcher);
    let owner_id = user.id;
    let dispatch = tokio::spawn(async move {
        dispatcher
            .dispatch_job(
                owner_id,
                runner_id,
                "echo hi",
                60,
                Some("worker-1".to_string()),
                None,
            )
            .await
    });

    let exec_request = next_json(&mut stream).await;
    assert_eq!(exec_request["type"], "exec_request");
    assert_eq!(exec_request["command"], "echo hi");
    assert_eq!(exec_request["timeout_secs"], 60);
    let job_id = exec_request["job_id"].as_str().unwrap().to_string();

    sink.send(frame(serde_json::json!({
        "type": "exec_chunk",
        "job_id": job_id,
        "stream": "stdout",
        "data": "hi\n",
    })))
    .await
    .unwrap();
    sink.send(frame(serde_json::json!({
        "type": "exec_done",
        "job_id": job_id,
        "exit_code": 0,
    })))
    .await
    .unwrap();

    let result = dispatch.await.unwrap();
    assert_eq!(result["ok"], true);
    assert_eq!(result["data"]["exit_code"], 0);
    assert_eq!(result["data"]["stdout_tail"], "hi\n");

    // The job row settled and the runner is free again.
    let job = harness
        .db
        .get_runner_job(job_id.parse().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, brigade::models::RunnerJobStatus::Success);
    assert_eq!(job.exit_code, Some(0));
    assert!(harness.dispatcher.can_accept_job(runner.id));

    // The chunk reached the worker output buffer and the bus.
    assert!(harness.output_buffer.get_tail("worker-1", None).contains("hi"));
    let chunk_event = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let event = bus_stream.next().await.unwrap();
            if event.event_type == brigade::events::EventType::WorkerOutputChunk {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(chunk_event.payload["data"], "hi\n");
    assert_eq!(chunk_event.payload["worker_id"], "worker-1");
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let harness = Harness::new(vec![]);
    let user = harness.user("owner@example.com").await;
    let runner = harness
        .db
        .create_runner(user.id, "cube", &hash_secret(RUNNER_SECRET))
        .await
        .unwrap();

    let url = start_server(&harness).await;
    let (socket, _) = connect_async(&url).await.unwrap();
    let (mut sink, mut stream) = socket.split();

    sink.send(frame(serde_json::json!({
        "type": "hello",
        "runner_id": runner.id,
        "secret": "totally-wrong",
    })))
    .await
    .unwrap();

    // The server closes without ever acknowledging.
    let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
        .await
        .expect("close deadline");
    match outcome {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
    assert!(!harness.connections.is_online(runner.id));
}

#[tokio::test]
async fn disconnect_takes_runner_offline() {
    let harness = Harness::new(vec![]);
    let user = harness.user("owner@example.com").await;
    let runner = harness
        .db
        .create_runner(user.id, "cube", &hash_secret(RUNNER_SECRET))
        .await
        .unwrap();

    let url = start_server(&harness).await;
    let (socket, _) = connect_async(&url).await.unwrap();
    let (mut sink, mut stream) = socket.split();
    sink.send(frame(serde_json::json!({
        "type": "hello",
        "runner_id": runner.id,
        "secret": RUNNER_SECRET,
    })))
    .await
    .unwrap();
    let _ = next_json(&mut stream).await;

    drop(sink);
    drop(stream);

    let db = Arc::clone(&harness.db);
    let runner_id = runner.id;
    harness
        .wait_until(|| {
            let db = Arc::clone(&db);
            async move {
                db.get_runner(runner_id).await.unwrap().unwrap().status == RunnerStatus::Offline
            }
        })
        .await;
    assert!(!harness.connections.is_online(runner.id));
}
