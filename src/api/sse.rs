//! Per-course SSE stream assembly with Last-Event-ID resumption.
//!
//! Replays the durable log past the client's cursor, then switches to the
//! live bus. Durable events carry their sequence number as the SSE `id`
//! line; bus-only events (heartbeats, tokens, output chunks) are passed
//! through without one. Live events at or below the replay cursor are
//! dropped, so the hand-off cannot duplicate numbered events.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt, stream};
use std::time::Duration;

use crate::error::DatabaseError;
use crate::events::CourseEventLog;

fn frame(event_type: &str, payload: &serde_json::Value, seq: Option<i64>) -> Event {
    let mut event = Event::default()
        .event(event_type)
        .data(payload.to_string());
    if let Some(seq) = seq {
        event = event.id(seq.to_string());
    }
    event
}

/// Build the SSE response for one course.
pub async fn course_stream(
    log: &CourseEventLog,
    course_id: i64,
    after_seq: i64,
) -> Result<
    Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static + use<>>,
    DatabaseError,
> {
    // Subscribe before reading the log so nothing falls in the gap; the
    // seq filter below deduplicates the overlap.
    let live = log.bus().subscribe_stream();

    let replayed = log.replay_after(course_id, after_seq).await?;
    let cursor = replayed.last().map(|e| e.seq).unwrap_or(after_seq);

    let replay_frames: Vec<Result<Event, Infallible>> = replayed
        .iter()
        .map(|e| Ok(frame(&e.event_type, &e.payload, Some(e.seq))))
        .collect();

    let live_frames = live.filter_map(move |bus_event| {
        let matches_course = bus_event
            .payload
            .get("course_id")
            .and_then(|v| v.as_i64())
            == Some(course_id);
        let result = if !matches_course {
            None
        } else {
            match bus_event.payload.get("seq").and_then(|v| v.as_i64()) {
                Some(seq) if seq <= cursor => None,
                seq => Some(Ok(frame(
                    bus_event.event_type.as_str(),
                    &bus_event.payload,
                    seq,
                ))),
            }
        };
        async move { result }
    });

    let combined = stream::iter(replay_frames).chain(live_frames);
    Ok(Sse::new(combined).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text("")))
}
