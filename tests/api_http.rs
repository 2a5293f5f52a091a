//! HTTP surface tests over the assembled router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use brigade::api::TRIGGER_BODY_LIMIT;
use brigade::api::auth::sign_token;
use brigade::config::Config;
use brigade::db::Database;
use brigade::llm::ScriptedTurn;
use brigade::models::{CourseStatus, QueueStatus, UserRole};
use common::Harness;
use secrecy::SecretString;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn auth_disabled_mints_dev_user() {
    let harness = Harness::new(vec![]);
    let router = harness.router();

    let response = router
        .oneshot(Request::builder().uri("/fiches").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let dev = harness.db.get_user_by_email("dev@local").await.unwrap();
    assert!(dev.is_some());
}

fn authed_config() -> Config {
    let mut config = Config::for_tests();
    config.auth_disabled = false;
    config.jwt_secret = Some(SecretString::from("test-jwt-secret"));
    config
}

#[tokio::test]
async fn bearer_auth_and_ownership_scoping() {
    let harness = Harness::with_config(vec![], authed_config());
    let alice = harness.user("alice@example.com").await;
    let bob = harness.user("bob@example.com").await;
    let admin = harness.admin("admin@example.com").await;

    let alice_token = sign_token("test-jwt-secret", alice.id, &alice.email, 3600);
    let bob_token = sign_token("test-jwt-secret", bob.id, &bob.email, 3600);
    let admin_token = sign_token("test-jwt-secret", admin.id, &admin.email, 3600);

    // No token: 401.
    let response = harness
        .router()
        .oneshot(Request::builder().uri("/threads").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Alice creates a fiche and a thread via the task endpoint.
    let response = harness
        .router()
        .oneshot({
            let mut req = json_request(
                "POST",
                "/fiches",
                serde_json::json!({"name": "helper", "model": "scripted"}),
            );
            req.headers_mut().insert(
                "authorization",
                format!("Bearer {alice_token}").parse().unwrap(),
            );
            req
        })
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let fiche = body_json(response).await;
    let fiche_id = fiche["id"].as_i64().unwrap();

    // Bob cannot read Alice's fiche; the admin can.
    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/fiches/{fiche_id}"))
                .header("authorization", format!("Bearer {bob_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/fiches/{fiche_id}"))
                .header("authorization", format!("Bearer {admin_token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Garbage token: 401.
    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri("/threads")
                .header("authorization", "Bearer not.a.token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn concierge_chat_happy_path() {
    let harness = Harness::new(vec![ScriptedTurn::Text("hello there".to_string())]);

    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/concierge/chat",
            serde_json::json!({"task": "say hello", "timeout": 10, "return_on_deferred": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["result"], "hello there");
    let course_id = body["course_id"].as_i64().unwrap();
    assert_eq!(
        body["stream_url"],
        format!("/courses/{course_id}/events")
    );

    let course = harness.db.get_course(course_id).await.unwrap().unwrap();
    assert_eq!(course.status, CourseStatus::Success);
}

#[tokio::test]
async fn concierge_chat_rejects_empty_task() {
    let harness = Harness::new(vec![]);
    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/concierge/chat",
            serde_json::json!({"task": "  "}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

async fn create_trigger(harness: &Harness) -> (i64, String) {
    // Dev user owns a fiche with a webhook trigger.
    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/fiches",
            serde_json::json!({"name": "hooked", "model": "scripted"}),
        ))
        .await
        .unwrap();
    let fiche = body_json(response).await;

    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/triggers",
            serde_json::json!({"fiche_id": fiche["id"], "kind": "webhook"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let trigger = body_json(response).await;
    (
        trigger["id"].as_i64().unwrap(),
        trigger["secret"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn webhook_fire_accepts_and_creates_one_course() {
    let harness = Harness::new(vec![]);
    let (trigger_id, secret) = create_trigger(&harness).await;

    let mut stream = Box::pin(harness.bus.subscribe_stream());

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/triggers/{trigger_id}/events"))
                .header("authorization", format!("Bearer {secret}"))
                .header("content-type", "application/json")
                .body(Body::from(r#"{"foo":1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    use futures::StreamExt;
    let event = stream.next().await.unwrap();
    assert_eq!(event.event_type, brigade::events::EventType::TriggerFired);
    assert_eq!(event.payload["trigger_id"], trigger_id);
    assert_eq!(event.payload["payload"]["foo"], 1);
    assert_eq!(event.payload["trigger_type"], "webhook");

    // Exactly one queued course execution entry.
    let entries = harness
        .db
        .list_queue_entries(Some("fiche_run"), Some(QueueStatus::Pending))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn webhook_fire_n_times_creates_n_courses() {
    let harness = Harness::new(vec![]);
    let (trigger_id, secret) = create_trigger(&harness).await;

    for _ in 0..3 {
        let response = harness
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/triggers/{trigger_id}/events"))
                    .header("authorization", format!("Bearer {secret}"))
                    .body(Body::from(r#"{"foo":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    // No dedup at the trigger layer: three distinct courses.
    let entries = harness
        .db
        .list_queue_entries(Some("fiche_run"), None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 3);
}

#[tokio::test]
async fn webhook_rejects_bad_secret_and_unknown_trigger() {
    let harness = Harness::new(vec![]);
    let (trigger_id, _secret) = create_trigger(&harness).await;

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/triggers/{trigger_id}/events"))
                .header("authorization", "Bearer wrong-secret")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/triggers/9999/events")
                .header("authorization", "Bearer whatever")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_body_limit_boundary() {
    let harness = Harness::new(vec![]);
    let (trigger_id, secret) = create_trigger(&harness).await;

    // Exactly at the limit: accepted.
    let pad = "x".repeat(TRIGGER_BODY_LIMIT - r#"{"pad":""}"#.len());
    let at_limit = format!(r#"{{"pad":"{pad}"}}"#);
    assert_eq!(at_limit.len(), TRIGGER_BODY_LIMIT);

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/triggers/{trigger_id}/events"))
                .header("authorization", format!("Bearer {secret}"))
                .body(Body::from(at_limit.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // One byte over: 413.
    let over = format!(r#"{{"pad":"{pad}x"}}"#);
    assert_eq!(over.len(), TRIGGER_BODY_LIMIT + 1);
    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/triggers/{trigger_id}/events"))
                .header("authorization", format!("Bearer {secret}"))
                .body(Body::from(over))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn job_trigger_requires_admin() {
    let harness = Harness::new(vec![]);
    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/jobs/queue_health/trigger",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn job_trigger_dedupes_on_minute() {
    let mut config = Config::for_tests();
    config.admin_emails = vec!["dev@local".to_string()];
    let harness = Harness::with_config(vec![], config);

    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/jobs/queue_health/trigger",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let first = body_json(response).await;
    assert_eq!(first["queued"], true);

    let dev = harness
        .db
        .get_user_by_email("dev@local")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dev.role, UserRole::Admin);

    // Same minute: the dedupe key absorbs the duplicate.
    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/jobs/queue_health/trigger",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    let second = body_json(response).await;
    assert_eq!(second["queued"], false);
    assert_eq!(second["entry_id"], first["entry_id"]);

    // Unknown job id: 404.
    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/jobs/no-such-job/trigger",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn internal_continue_requires_token_and_deferred_course() {
    let harness = Harness::new(vec![ScriptedTurn::Text("done".to_string())]);

    // A terminal course via a quick concierge turn.
    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/concierge/chat",
            serde_json::json!({"task": "quick"}),
        ))
        .await
        .unwrap();
    let course_id = body_json(response).await["course_id"].as_i64().unwrap();

    // Missing token: 401.
    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/internal/courses/{course_id}/continue"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Valid token but the course is not deferred: 409.
    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/internal/courses/{course_id}/continue"))
                .header("x-internal-token", "internal-test-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn course_events_stream_resumes_from_cursor() {
    let harness = Harness::new(vec![ScriptedTurn::Text("hi".to_string())]);

    let response = harness
        .router()
        .oneshot(json_request(
            "POST",
            "/concierge/chat",
            serde_json::json!({"task": "hi"}),
        ))
        .await
        .unwrap();
    let course_id = body_json(response).await["course_id"].as_i64().unwrap();

    let response = harness
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/courses/{course_id}/events?last_event_id=0"))
                .header("last-event-id", "0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
}
