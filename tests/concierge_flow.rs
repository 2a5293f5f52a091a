//! End-to-end concierge/commis orchestration over the in-memory platform:
//! spawn, defer, worker execution, barrier release, continuation, with
//! every observable event landing on the originating course stream.

mod common;

use brigade::concierge::ConciergeOptions;
use brigade::db::Database;
use brigade::llm::{ScriptedTurn, ToolCall};
use brigade::models::{CommisStatus, CourseStatus, CourseTrigger, MessageRole};
use common::Harness;

fn spawn_call(id: &str, task: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: "spawn_commis".to_string(),
        args: serde_json::json!({"task": task}),
    }
}

#[tokio::test]
async fn single_commis_spawn_and_continuation_on_original_stream() {
    // Script order: concierge turn (spawns), commis run, continuation turn.
    let harness = Harness::new(vec![
        ScriptedTurn::ToolCalls(vec![spawn_call("call_1", "df -h on cube")]),
        ScriptedTurn::Text("/dev/sda1 45% used".to_string()),
        ScriptedTurn::Text("cube is at 45% disk usage, plenty of headroom.".to_string()),
    ]);
    let user = harness.user("owner@example.com").await;

    let result = harness
        .concierge
        .run_concierge(
            user.id,
            "check disk space on cube",
            ConciergeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.status, CourseStatus::Deferred);
    let course_id = result.course_id;

    // The deferring turn emitted started, completed, deferred as seqs 1-3.
    let events = harness
        .db
        .list_course_events_after(course_id, 0)
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "concierge_tool_started",
            "concierge_tool_completed",
            "supervisor_deferred"
        ]
    );
    assert_eq!(events[1].payload["result"]["job_id"].as_i64(), {
        let barrier = harness.db.get_barrier(course_id).await.unwrap().unwrap();
        Some(barrier.job_ids[0])
    });

    // Run the queue: the commis executes and triggers the continuation.
    harness.drain_queue().await;

    // Continuation runs on a detached task; wait for it to settle.
    let db = std::sync::Arc::clone(&harness.db);
    harness
        .wait_until(|| {
            let db = std::sync::Arc::clone(&db);
            async move {
                match db.find_continuation(course_id).await.unwrap() {
                    Some(c) => c.status == CourseStatus::Success,
                    None => false,
                }
            }
        })
        .await;

    let continuation = harness
        .db
        .find_continuation(course_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(continuation.trigger, CourseTrigger::Continuation);
    assert_eq!(continuation.status, CourseStatus::Success);
    assert!(
        continuation
            .summary
            .as_deref()
            .unwrap()
            .contains("45% disk usage")
    );

    // The parent stays deferred; its stream carries the whole story.
    let parent = harness.db.get_course(course_id).await.unwrap().unwrap();
    assert_eq!(parent.status, CourseStatus::Deferred);

    let events = harness
        .db
        .list_course_events_after(course_id, 0)
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"commis_started"));
    assert!(types.contains(&"commis_complete"));
    assert_eq!(*types.last().unwrap(), "supervisor_complete");

    // Sequence numbers are contiguous from 1 on the parent stream.
    let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=events.len() as i64).collect::<Vec<_>>());

    // The thread holds the full turn: user, assistant(tool_call), worker
    // tool message, final assistant.
    let messages = harness.db.list_messages(result.thread_id).await.unwrap();
    let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Assistant
        ]
    );
    assert!(messages[2].content.contains("[Worker job"));
    assert!(messages[2].content.contains("/dev/sda1 45% used"));
}

#[tokio::test]
async fn two_commis_one_fails_chain_still_completes() {
    let harness = Harness::new(vec![
        // Concierge spawns two workers in one step.
        ScriptedTurn::ToolCalls(vec![
            spawn_call("call_1", "check disk"),
            spawn_call("call_2", "check network"),
        ]),
        // Worker 1 succeeds.
        ScriptedTurn::Text("disk fine".to_string()),
        // Worker 2 trips a critical envelope (spawn_commis is concierge-only)
        // and then produces no answer, so its job fails.
        ScriptedTurn::ToolCalls(vec![spawn_call("call_nested", "nested")]),
        ScriptedTurn::Text(String::new()),
        // Continuation sees both outcomes.
        ScriptedTurn::Text("disk fine; network check failed".to_string()),
    ]);
    let user = harness.user("owner@example.com").await;

    let result = harness
        .concierge
        .run_concierge(user.id, "check everything", ConciergeOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, CourseStatus::Deferred);
    let course_id = result.course_id;

    let barrier = harness.db.get_barrier(course_id).await.unwrap().unwrap();
    assert_eq!(barrier.job_ids.len(), 2);

    harness.drain_queue().await;

    let db = std::sync::Arc::clone(&harness.db);
    harness
        .wait_until(|| {
            let db = std::sync::Arc::clone(&db);
            async move {
                match db.find_continuation(course_id).await.unwrap() {
                    Some(c) => c.status == CourseStatus::Success,
                    None => false,
                }
            }
        })
        .await;

    // One commis succeeded, one failed; both summaries reached the thread.
    let jobs = harness.db.list_commis_jobs(Some(user.id)).await.unwrap();
    let statuses: Vec<CommisStatus> = jobs.iter().map(|j| j.status).collect();
    assert!(statuses.contains(&CommisStatus::Success));
    assert!(statuses.contains(&CommisStatus::Failed));

    let events = harness
        .db
        .list_course_events_after(course_id, 0)
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&"commis_complete"));
    assert!(types.contains(&"commis_failed"));
    assert_eq!(*types.last().unwrap(), "supervisor_complete");

    let messages = harness.db.list_messages(result.thread_id).await.unwrap();
    let worker_messages: Vec<_> = messages
        .iter()
        .filter(|m| m.content.contains("[Worker job"))
        .collect();
    assert_eq!(worker_messages.len(), 2);
}

#[tokio::test]
async fn return_on_deferred_false_waits_for_chain_result() {
    let harness = Harness::new(vec![
        ScriptedTurn::ToolCalls(vec![spawn_call("call_1", "slow work")]),
        ScriptedTurn::Text("slow work done".to_string()),
        ScriptedTurn::Text("all finished: slow work done".to_string()),
    ]);
    let user = harness.user("owner@example.com").await;

    // Drive the queue from a background task while the turn awaits.
    let worker = std::sync::Arc::clone(&harness.worker);
    let pump = tokio::spawn(async move {
        loop {
            if !worker.run_once().await.unwrap() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    });

    let result = harness
        .concierge
        .run_concierge(
            user.id,
            "do slow work",
            ConciergeOptions {
                return_on_deferred: false,
                ..ConciergeOptions::default()
            },
        )
        .await
        .unwrap();
    pump.abort();

    assert_eq!(result.status, CourseStatus::Success);
    assert_eq!(result.result.as_deref(), Some("all finished: slow work done"));

    // Parent deferred, continuation success.
    let parent = harness.db.get_course(result.course_id).await.unwrap().unwrap();
    assert_eq!(parent.status, CourseStatus::Deferred);
    let continuation = harness
        .db
        .find_continuation(result.course_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(continuation.status, CourseStatus::Success);
}

#[tokio::test]
async fn no_spawn_means_no_deferred_event() {
    let harness = Harness::new(vec![ScriptedTurn::Text("hello".to_string())]);
    let user = harness.user("owner@example.com").await;

    let result = harness
        .concierge
        .run_concierge(
            user.id,
            "say hello",
            ConciergeOptions {
                return_on_deferred: true,
                ..ConciergeOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, CourseStatus::Success);
    let events = harness
        .db
        .list_course_events_after(result.course_id, 0)
        .await
        .unwrap();
    assert!(events.iter().all(|e| e.event_type != "supervisor_deferred"));
    assert_eq!(events.last().unwrap().event_type, "supervisor_complete");
}

#[tokio::test]
async fn cancelled_parent_cascades_to_commis() {
    let harness = Harness::new(vec![ScriptedTurn::ToolCalls(vec![spawn_call(
        "call_1",
        "doomed work",
    )])]);
    let user = harness.user("owner@example.com").await;

    let result = harness
        .concierge
        .run_concierge(user.id, "start doomed work", ConciergeOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, CourseStatus::Deferred);

    let cancelled = harness
        .concierge
        .cancel_course(&harness.barrier, result.course_id)
        .await
        .unwrap();
    assert!(cancelled);

    let course = harness.db.get_course(result.course_id).await.unwrap().unwrap();
    assert_eq!(course.status, CourseStatus::Failed);
    assert!(harness.db.get_barrier(result.course_id).await.unwrap().is_none());

    let jobs = harness.db.list_commis_jobs(Some(user.id)).await.unwrap();
    assert!(jobs.iter().all(|j| j.status == CommisStatus::Cancelled));

    // No continuation ever appears, even after the queue drains.
    harness.drain_queue().await;
    assert!(
        harness
            .db
            .find_continuation(result.course_id)
            .await
            .unwrap()
            .is_none()
    );
}
