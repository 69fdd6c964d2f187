//! Pipeline event types, envelope schema, and event bus.
//!
//! A single broadcast channel carries everything the pipeline reports:
//! task lifecycle, concurrency adjustments, breaker trips, and the
//! `StageWake` signals that chain one stage into the next. UI surfaces and
//! telemetry subscribe independently.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{Capability, Stage};

// ============================================================================
// Event Envelope
// ============================================================================

/// Versioned event envelope.
///
/// The `event_type` field uses dot-namespaced names (e.g. `"task.failed"`,
/// `"breaker.tripped"`). `payload_version` increments on breaking payload
/// changes; consumers should ignore unknown fields.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event type.
    pub event_type: String,
    /// When the event occurred (UTC).
    pub occurred_at: DateTime<Utc>,
    /// Type of entity this event relates to (e.g. `"task"`, `"capability"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// ID of the entity this event relates to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Payload schema version.
    pub payload_version: u32,
    /// Domain-specific event data.
    pub payload: PipelineEvent,
}

impl EventEnvelope {
    pub fn new(event: PipelineEvent) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.namespaced_event_type().to_string(),
            occurred_at: Utc::now(),
            entity_type: event.entity_type().map(String::from),
            entity_id: event.entity_id(),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Pipeline Event (domain payloads)
// ============================================================================

/// The most recent failure that contributed to a breaker trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TripCause {
    pub capability: Capability,
    pub message: String,
}

/// Notice broadcast when the circuit breaker trips.
///
/// Serialized in camelCase for UI consumers:
/// `{"windowMs":10000,"threshold":3,"count":3,"last":{"capability":"vlm","message":"..."}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerTripped {
    pub window_ms: u64,
    pub threshold: usize,
    /// Failures inside the window at trip time.
    pub count: usize,
    pub last: TripCause,
}

/// Events serialized as JSON with a `type` tag field, e.g.
/// `{"type":"TaskFailed","stage":"embedding","task_id":4,...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A task was claimed and its work started.
    TaskStarted {
        stage: Stage,
        task_id: i64,
        attempt: u32,
    },
    /// A task finished successfully.
    TaskSucceeded {
        stage: Stage,
        task_id: i64,
        duration_ms: u64,
    },
    /// A task attempt failed.
    TaskFailed {
        stage: Stage,
        task_id: i64,
        attempts: u32,
        permanent: bool,
        error: String,
    },
    /// Abandoned `running` rows were returned to the queue.
    StaleRecovered { stage: Stage, count: u64 },
    /// A stage has new work and should run soon.
    StageWake { stage: Stage, reason: String },
    /// The adaptive tuner changed a capability's limit.
    ConcurrencyAdjusted {
        capability: Capability,
        previous: usize,
        current: usize,
    },
    /// The circuit breaker tripped and capture was stopped.
    BreakerTripped(BreakerTripped),
    /// The circuit breaker was cleared.
    BreakerReset { resumed_capture: bool },
}

impl PipelineEvent {
    /// Namespaced event type for the envelope (e.g. `"task.failed"`).
    pub fn namespaced_event_type(&self) -> &'static str {
        match self {
            PipelineEvent::TaskStarted { .. } => "task.started",
            PipelineEvent::TaskSucceeded { .. } => "task.succeeded",
            PipelineEvent::TaskFailed { .. } => "task.failed",
            PipelineEvent::StaleRecovered { .. } => "stage.stale_recovered",
            PipelineEvent::StageWake { .. } => "stage.wake",
            PipelineEvent::ConcurrencyAdjusted { .. } => "governor.concurrency_adjusted",
            PipelineEvent::BreakerTripped(_) => "breaker.tripped",
            PipelineEvent::BreakerReset { .. } => "breaker.reset",
        }
    }

    /// Entity type this event relates to.
    pub fn entity_type(&self) -> Option<&'static str> {
        match self {
            PipelineEvent::TaskStarted { .. }
            | PipelineEvent::TaskSucceeded { .. }
            | PipelineEvent::TaskFailed { .. } => Some("task"),
            PipelineEvent::StaleRecovered { .. } | PipelineEvent::StageWake { .. } => {
                Some("stage")
            }
            PipelineEvent::ConcurrencyAdjusted { .. } => Some("capability"),
            PipelineEvent::BreakerTripped(_) | PipelineEvent::BreakerReset { .. } => None,
        }
    }

    /// Primary entity id this event relates to.
    pub fn entity_id(&self) -> Option<String> {
        match self {
            PipelineEvent::TaskStarted { task_id, .. }
            | PipelineEvent::TaskSucceeded { task_id, .. }
            | PipelineEvent::TaskFailed { task_id, .. } => Some(task_id.to_string()),
            PipelineEvent::StaleRecovered { stage, .. } | PipelineEvent::StageWake { stage, .. } => {
                Some(stage.to_string())
            }
            PipelineEvent::ConcurrencyAdjusted { capability, .. } => Some(capability.to_string()),
            PipelineEvent::BreakerTripped(_) | PipelineEvent::BreakerReset { .. } => None,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Broadcast-based event bus for distributing pipeline events.
///
/// Uses `tokio::sync::broadcast` with a configurable buffer size. Receivers
/// that fall behind get `Lagged` and miss events; stage wake-ups tolerate
/// this because every scheduler also polls on its own interval.
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event to all subscribers.
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let envelope = EventEnvelope::new(event);
        let subscriber_count = self.tx.receiver_count();
        tracing::trace!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count,
            "EventBus emit"
        );
        let _ = self.tx.send(envelope);
    }

    /// Subscribe to receive enveloped events. Each subscriber gets its own independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Run `callback` for every event until the returned [`Subscription`] is
    /// dropped or unsubscribed. Must be called inside a tokio runtime.
    pub fn listen<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EventEnvelope) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => callback(&envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event listener lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription {
            handle: Some(handle),
        }
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Handle for a callback registered with [`EventBus::listen`].
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Stop delivering events to the callback.
    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_event_bus_emit_subscribe() {
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();

        bus.emit(PipelineEvent::StageWake {
            stage: Stage::Embedding,
            reason: "upstream".into(),
        });

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(
            envelope.payload,
            PipelineEvent::StageWake {
                stage: Stage::Embedding,
                ..
            }
        ));
        assert_eq!(envelope.event_type, "stage.wake");
        assert_eq!(envelope.payload_version, 1);
        assert_eq!(envelope.entity_id.as_deref(), Some("embedding"));
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.emit(PipelineEvent::BreakerReset {
            resumed_capture: false,
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_breaker_tripped_serializes_camel_case() {
        let event = BreakerTripped {
            window_ms: 10_000,
            threshold: 3,
            count: 3,
            last: TripCause {
                capability: Capability::Vlm,
                message: "503".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["windowMs"], 10_000);
        assert_eq!(json["threshold"], 3);
        assert_eq!(json["count"], 3);
        assert_eq!(json["last"]["capability"], "vlm");
        assert_eq!(json["last"]["message"], "503");
    }

    #[test]
    fn test_pipeline_event_tagged_serialization() {
        let event = PipelineEvent::TaskFailed {
            stage: Stage::TextRecognition,
            task_id: 7,
            attempts: 2,
            permanent: false,
            error: "timeout".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "TaskFailed");
        assert_eq!(json["stage"], "text_recognition");
        assert_eq!(json["task_id"], 7);
    }

    #[test]
    fn test_envelope_entity_metadata() {
        let envelope = EventEnvelope::new(PipelineEvent::ConcurrencyAdjusted {
            capability: Capability::Text,
            previous: 4,
            current: 2,
        });
        assert_eq!(envelope.event_type, "governor.concurrency_adjusted");
        assert_eq!(envelope.entity_type.as_deref(), Some("capability"));
        assert_eq!(envelope.entity_id.as_deref(), Some("text"));
    }

    #[tokio::test]
    async fn test_listen_delivers_until_unsubscribed() {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = bus.listen(move |envelope| {
            sink.lock().unwrap().push(envelope.event_type.clone());
        });
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(PipelineEvent::StaleRecovered {
            stage: Stage::Indexing,
            count: 2,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["stage.stale_recovered"]);

        subscription.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.emit(PipelineEvent::BreakerReset {
            resumed_capture: true,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = EventBus::new(16);
        {
            let _subscription = bus.listen(|_| {});
            assert_eq!(bus.subscriber_count(), 1);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.subscriber_count(), 0);
    }
}
