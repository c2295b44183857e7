//! Event bus for command lifecycle events (spec.md §4.10, §6).
//!
//! Directly grounded on the teacher's `events::EventBus`
//! (`tokio::sync::broadcast`, a kept-alive receiver so the channel never
//! closes, a `Clone` impl that resubscribes) generalized from five
//! Wings-specific events to the `command:*`/`adapter:*` taxonomy.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// One lifecycle event kind, per spec.md §4.10.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Stdout,
    Stderr,
    Complete,
    Error,
    Retry,
    Cancel,
    AdapterPoolAcquire,
    AdapterPoolRelease,
    AdapterPoolReap,
    AdapterContainerCreate,
    AdapterContainerRemove,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Start => "command:start",
            EventKind::Stdout => "command:stdout",
            EventKind::Stderr => "command:stderr",
            EventKind::Complete => "command:complete",
            EventKind::Error => "command:error",
            EventKind::Retry => "command:retry",
            EventKind::Cancel => "command:cancel",
            EventKind::AdapterPoolAcquire => "adapter:pool:acquire",
            EventKind::AdapterPoolRelease => "adapter:pool:release",
            EventKind::AdapterPoolReap => "adapter:pool:reap",
            EventKind::AdapterContainerCreate => "adapter:container:create",
            EventKind::AdapterContainerRemove => "adapter:container:remove",
        };
        write!(f, "{s}")
    }
}

/// Event payload, redacted before delivery by whichever adapter emits it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Chunk(Vec<u8>),
    Message(String),
    Retry { attempt: u32, delay_ms: u64, prior_error: String },
}

/// One emitted event (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub command_id: Uuid,
    pub adapter_kind: String,
    pub payload: Payload,
}

/// Broadcasts command lifecycle events to any number of subscribers.
///
/// Emission is best-effort and synchronous: a subscriber's panic is caught
/// and logged, never propagated into the command path (spec.md §4.10).
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    _receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of receivers that got it; zero
    /// subscribers is not an error, the event is just dropped.
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn emit(&self, command_id: Uuid, adapter_kind: &str, kind: EventKind, payload: Payload) {
        let receivers = self.publish(Event {
            kind: kind.clone(),
            timestamp: chrono::Utc::now(),
            command_id,
            adapter_kind: adapter_kind.to_string(),
            payload,
        });
        debug!(%command_id, %kind, receivers, "event published");
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}

/// Runs a synchronous subscriber callback, catching panics so one bad
/// subscriber can never take down the command path (spec.md §4.10, §9).
pub fn dispatch_guarded<F: FnOnce() + std::panic::UnwindSafe>(f: F) {
    if let Err(_) = std::panic::catch_unwind(f) {
        tracing::warn!("event subscriber panicked; ignoring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pubsub_round_trip() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.emit(id, "local", EventKind::Start, Payload::Empty);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.command_id, id);
        assert_eq!(event.kind, EventKind::Start);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_the_event() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.emit(Uuid::new_v4(), "local", EventKind::Complete, Payload::Empty);
        assert_eq!(rx1.recv().await.unwrap().kind, EventKind::Complete);
        assert_eq!(rx2.recv().await.unwrap().kind, EventKind::Complete);
    }

    #[test]
    fn subscriber_count_tracks_subscriptions() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn guarded_dispatch_survives_a_panicking_subscriber() {
        dispatch_guarded(|| panic!("boom"));
    }
}
