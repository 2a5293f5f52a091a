//! In-process publish/subscribe broker.
//!
//! Topics are a closed enum. Two consumption styles:
//! - typed async callbacks registered with `subscribe`: `publish` awaits
//!   each handler in registration order, so per-subscriber ordering holds
//!   for any single awaiting publisher; a handler error is logged and
//!   dropped;
//! - a broadcast tap (`subscribe_stream`) for best-effort consumers such
//!   as SSE bridges, where a slow reader may miss events and is expected
//!   to resynchronize from the durable log.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Future;
use futures::Stream;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

/// Every event type the platform publishes. `as_str` is the wire spelling
/// used by SSE frames and the course event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    CourseCreated,
    CourseDeferred,
    CourseComplete,
    ConciergeToken,
    ConciergeToolStarted,
    ConciergeToolCompleted,
    ConciergeToolFailed,
    ConciergeHeartbeat,
    CommisStarted,
    CommisComplete,
    CommisFailed,
    CommisToolStarted,
    CommisToolCompleted,
    CommisToolFailed,
    TriggerFired,
    WorkerOutputChunk,
    Error,
}

impl EventType {
    /// Wire spelling. The deferred/complete pair keeps the legacy
    /// `supervisor_*` names SSE clients already speak.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::CourseCreated => "course_created",
            EventType::CourseDeferred => "supervisor_deferred",
            EventType::CourseComplete => "supervisor_complete",
            EventType::ConciergeToken => "concierge_token",
            EventType::ConciergeToolStarted => "concierge_tool_started",
            EventType::ConciergeToolCompleted => "concierge_tool_completed",
            EventType::ConciergeToolFailed => "concierge_tool_failed",
            EventType::ConciergeHeartbeat => "concierge_heartbeat",
            EventType::CommisStarted => "commis_started",
            EventType::CommisComplete => "commis_complete",
            EventType::CommisFailed => "commis_failed",
            EventType::CommisToolStarted => "commis_tool_started",
            EventType::CommisToolCompleted => "commis_tool_completed",
            EventType::CommisToolFailed => "commis_tool_failed",
            EventType::TriggerFired => "trigger_fired",
            EventType::WorkerOutputChunk => "worker_output_chunk",
            EventType::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published event as seen by broadcast-tap consumers.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type Handler = Arc<dyn Fn(serde_json::Value) -> HandlerFuture + Send + Sync>;

/// The process-wide broker. Subscriber lists are the only state and are
/// rebuilt at startup.
pub struct EventBus {
    subscribers: RwLock<HashMap<EventType, Vec<Handler>>>,
    tap: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        // 256-event buffer; slow taps miss events and replay from the log.
        let (tap, _) = broadcast::channel(256);
        Self {
            subscribers: RwLock::new(HashMap::new()),
            tap,
        }
    }

    /// Register an async callback for one event type.
    pub async fn subscribe<F, Fut>(&self, event_type: EventType, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |payload| -> HandlerFuture { Box::pin(handler(payload)) });
        self.subscribers
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Publish to every subscriber of the type, awaiting each in turn.
    pub async fn publish(&self, event_type: EventType, payload: serde_json::Value) {
        let handlers: Vec<Handler> = {
            let subscribers = self.subscribers.read().await;
            subscribers.get(&event_type).cloned().unwrap_or_default()
        };

        for handler in handlers {
            if let Err(e) = handler(payload.clone()).await {
                tracing::warn!(event_type = %event_type, "event handler failed: {}", e);
            }
        }

        let _ = self.tap.send(BusEvent {
            event_type,
            payload,
        });
    }

    /// Best-effort stream of all published events.
    pub fn subscribe_stream(&self) -> impl Stream<Item = BusEvent> + Send + 'static + use<> {
        BroadcastStream::new(self.tap.subscribe()).filter_map(|result| result.ok())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn publish_reaches_typed_subscriber() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        bus.subscribe(EventType::TriggerFired, move |payload| {
            let seen = Arc::clone(&seen);
            async move {
                assert_eq!(payload["trigger_id"], 7);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        bus.publish(EventType::TriggerFired, serde_json::json!({"trigger_id": 7}))
            .await;
        bus.publish(EventType::Error, serde_json::json!({})).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_is_swallowed() {
        let bus = EventBus::new();
        bus.subscribe(EventType::Error, |_| async { Err("boom".to_string()) })
            .await;
        // Must not panic or propagate.
        bus.publish(EventType::Error, serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn ordering_holds_per_subscriber_for_awaiting_publisher() {
        let bus = EventBus::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        bus.subscribe(EventType::CommisComplete, move |payload| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(payload["n"].as_i64().unwrap());
                Ok(())
            }
        })
        .await;

        for n in 0..5 {
            bus.publish(EventType::CommisComplete, serde_json::json!({"n": n}))
                .await;
        }

        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn stream_tap_receives_events() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.subscribe_stream());

        bus.publish(EventType::WorkerOutputChunk, serde_json::json!({"data": "hi"}))
            .await;

        let event = stream.next().await.unwrap();
        assert_eq!(event.event_type, EventType::WorkerOutputChunk);
        assert_eq!(event.payload["data"], "hi");
    }

    #[test]
    fn wire_names_keep_the_supervisor_prefix() {
        assert_eq!(EventType::CourseDeferred.as_str(), "supervisor_deferred");
        assert_eq!(EventType::CourseComplete.as_str(), "supervisor_complete");
        assert_eq!(EventType::ConciergeToolStarted.as_str(), "concierge_tool_started");
    }
}
