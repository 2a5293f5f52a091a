//! Continuation idempotency under concurrency: the unique back-pointer
//! guarantees at most one continuation per parent, and the worker tool
//! message lands exactly once.

mod common;

use std::sync::Arc;

use brigade::db::{Database, NewCommisJob};
use brigade::models::{CommisStatus, CourseStatus, CourseTrigger, MessageRole, NewFiche, ThreadKind, UserRole};
use common::Harness;
use uuid::Uuid;

struct Seeded {
    course_id: i64,
    thread_id: i64,
    job_a: i64,
    job_b: i64,
}

async fn seed_deferred(harness: &Harness) -> Seeded {
    let user = harness
        .db
        .create_user("owner@example.com", None, UserRole::User)
        .await
        .unwrap();
    let fiche = harness
        .db
        .create_fiche(&NewFiche::basic(user.id, "concierge", "scripted"))
        .await
        .unwrap();
    let thread = harness
        .db
        .create_thread(fiche.id, user.id, "t", ThreadKind::Concierge)
        .await
        .unwrap();
    let course = harness
        .db
        .create_course(
            fiche.id,
            thread.id,
            CourseTrigger::Api,
            CourseStatus::Running,
            Uuid::new_v4(),
        )
        .await
        .unwrap();

    let mut job_ids = Vec::new();
    for n in 0..2 {
        let job = harness
            .db
            .create_commis_job(&NewCommisJob {
                owner_id: user.id,
                concierge_course_id: course.id,
                task: format!("task {n}"),
                model: "scripted".to_string(),
                commis_id: format!("commis-{n}"),
                trace_id: Uuid::new_v4(),
                execution_mode: "plain".to_string(),
                git_repo: None,
            })
            .await
            .unwrap();
        job_ids.push(job.id);
    }
    harness.db.commit_spawn(course.id, &job_ids).await.unwrap();

    Seeded {
        course_id: course.id,
        thread_id: thread.id,
        job_a: job_ids[0],
        job_b: job_ids[1],
    }
}

#[tokio::test]
async fn concurrent_releases_create_exactly_one_continuation() {
    let harness = Harness::new(vec![]);
    let seeded = seed_deferred(&harness).await;

    // Both workers complete at the same moment.
    let barrier_a = Arc::clone(&harness.barrier);
    let barrier_b = Arc::clone(&harness.barrier);
    let (job_a, job_b) = (seeded.job_a, seeded.job_b);
    let (first, second) = tokio::join!(
        tokio::spawn(async move {
            barrier_a
                .release(job_a, CommisStatus::Success, Some("result a"))
                .await
                .unwrap()
        }),
        tokio::spawn(async move {
            barrier_b
                .release(job_b, CommisStatus::Success, Some("result b"))
                .await
                .unwrap()
        }),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    // Exactly one release observed the empty barrier.
    let ready: Vec<_> = outcomes.into_iter().flatten().collect();
    assert_eq!(ready.len(), 1);
    assert!(ready[0].created);

    let continuation = harness
        .db
        .find_continuation(seeded.course_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(continuation.id, ready[0].course.id);
    assert_eq!(continuation.trigger, CourseTrigger::Continuation);

    // Worker tool messages appear exactly once per job.
    let messages = harness.db.list_messages(seeded.thread_id).await.unwrap();
    let worker_messages: Vec<_> = messages
        .iter()
        .filter(|m| m.role == MessageRole::Tool && m.content.contains("[Worker job"))
        .collect();
    assert_eq!(worker_messages.len(), 2);
}

#[tokio::test]
async fn sequential_continuation_creation_is_idempotent() {
    let harness = Harness::new(vec![]);
    let seeded = seed_deferred(&harness).await;

    harness
        .barrier
        .release(seeded.job_a, CommisStatus::Success, Some("result a"))
        .await
        .unwrap();
    let ready = harness
        .barrier
        .release(seeded.job_b, CommisStatus::Success, Some("result b"))
        .await
        .unwrap()
        .unwrap();

    // A second creation attempt for the same parent returns the same row.
    let parent = harness
        .db
        .get_course(seeded.course_id)
        .await
        .unwrap()
        .unwrap();
    let (again, created) = harness
        .db
        .create_continuation(
            seeded.course_id,
            parent.fiche_id,
            parent.thread_id,
            parent.trace_id,
            &[brigade::models::NewThreadMessage::tool(
                seeded.thread_id,
                "[Worker job 999 (ghost)] success: duplicate",
                None,
            )],
        )
        .await
        .unwrap();

    assert!(!created);
    assert_eq!(again.id, ready.course.id);

    // The duplicate's message was not injected.
    let messages = harness.db.list_messages(seeded.thread_id).await.unwrap();
    assert!(messages.iter().all(|m| !m.content.contains("ghost")));
}

#[tokio::test]
async fn non_continuation_courses_are_unconstrained() {
    let harness = Harness::new(vec![]);
    let user = harness
        .db
        .create_user("owner@example.com", None, UserRole::User)
        .await
        .unwrap();
    let fiche = harness
        .db
        .create_fiche(&NewFiche::basic(user.id, "f", "scripted"))
        .await
        .unwrap();
    let thread = harness
        .db
        .create_thread(fiche.id, user.id, "t", ThreadKind::Manual)
        .await
        .unwrap();

    // Many courses with a NULL back-pointer coexist happily.
    for _ in 0..3 {
        harness
            .db
            .create_course(
                fiche.id,
                thread.id,
                CourseTrigger::Api,
                CourseStatus::Success,
                Uuid::new_v4(),
            )
            .await
            .unwrap();
    }
    let courses = harness.db.list_courses(fiche.id, None, 10).await.unwrap();
    assert_eq!(courses.len(), 3);
    assert!(courses.iter().all(|c| c.continuation_of_course_id.is_none()));
}
