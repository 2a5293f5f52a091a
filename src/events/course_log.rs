//! Durable per-course event log bridged to the in-process bus.
//!
//! The log carries the durable copy (SSE replay reads it back by sequence
//! number); the bus carries the live copy. `append` does both: the insert
//! assigns the next per-course seq, then the enriched record goes out on
//! the bus.

use std::sync::Arc;

use crate::db::Database;
use crate::error::DatabaseError;
use crate::events::{EventBus, EventType};
use crate::models::CourseEvent;

pub struct CourseEventLog {
    db: Arc<dyn Database>,
    bus: Arc<EventBus>,
}

impl CourseEventLog {
    pub fn new(db: Arc<dyn Database>, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Persist the event with the next sequence number and publish the
    /// enriched record live. The payload on the bus gains `course_id`,
    /// `seq` and `event_type` so SSE consumers can frame it directly.
    pub async fn append(
        &self,
        course_id: i64,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<CourseEvent, DatabaseError> {
        let record = self
            .db
            .append_course_event(course_id, event_type.as_str(), &payload)
            .await?;

        let mut live = payload;
        if let Some(map) = live.as_object_mut() {
            map.insert("course_id".to_string(), serde_json::json!(course_id));
            map.insert("seq".to_string(), serde_json::json!(record.seq));
            map.insert(
                "event_type".to_string(),
                serde_json::json!(event_type.as_str()),
            );
        }
        self.bus.publish(event_type, live).await;

        Ok(record)
    }

    /// Replay events with `seq > after_seq` in order.
    pub async fn replay_after(
        &self,
        course_id: i64,
        after_seq: i64,
    ) -> Result<Vec<CourseEvent>, DatabaseError> {
        self.db.list_course_events_after(course_id, after_seq).await
    }
}
