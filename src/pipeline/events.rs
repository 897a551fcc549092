//! Event stream of a pipeline run
//!
//! Provides typed events for drivers that want to follow a run as it happens

use std::fmt;

use async_broadcast::{InactiveReceiver, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Runtime event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    UnitRegistered {
        unit: String,
        priority: i32,
        seed: u64,
    },
    UnitDispatched {
        unit: String,
        priority: i32,
    },
    UnitStarted {
        unit: String,
        dedicated_worker: bool,
    },
    UnitCompleted {
        unit: String,
    },
    UnitFailed {
        unit: String,
        error: String,
    },
    RunFinished {
        run_id: String,
        elapsed_ms: u64,
    },
}

impl PipelineEvent {
    /// Unit the event is about, if any
    pub fn unit(&self) -> Option<&str> {
        match self {
            PipelineEvent::UnitRegistered { unit, .. }
            | PipelineEvent::UnitDispatched { unit, .. }
            | PipelineEvent::UnitStarted { unit, .. }
            | PipelineEvent::UnitCompleted { unit }
            | PipelineEvent::UnitFailed { unit, .. } => Some(unit),
            PipelineEvent::RunFinished { .. } => None,
        }
    }
}

/// Broadcast channel carrying [`PipelineEvent`]s.
///
/// Emitting never blocks: with no subscriber the event is dropped, and a
/// full channel drops its oldest event.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<PipelineEvent>,
    // Keeps the channel open while nobody is subscribed
    idle: InactiveReceiver<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(capacity.max(1));
        tx.set_overflow(true); // Drop oldest events when full
        Self {
            tx,
            idle: rx.deactivate(),
        }
    }

    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.try_broadcast(event);
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        self.idle.activate_cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.tx.capacity())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(PipelineEvent::UnitCompleted { unit: "a".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_sees_later_events() {
        let bus = EventBus::new(4);
        bus.emit(PipelineEvent::UnitCompleted { unit: "before".into() });

        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::UnitCompleted { unit: "after".into() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.unit(), Some("after"));
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for unit in ["a", "b", "c"] {
            bus.emit(PipelineEvent::UnitCompleted { unit: unit.into() });
        }

        // The receiver first learns it missed one event
        assert!(matches!(rx.recv().await, Err(async_broadcast::RecvError::Overflowed(1))));
        assert_eq!(rx.recv().await.unwrap().unit(), Some("b"));
        assert_eq!(rx.recv().await.unwrap().unit(), Some("c"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = PipelineEvent::UnitStarted {
            unit: "height_map".into(),
            dedicated_worker: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "UnitStarted");
        assert_eq!(json["unit"], "height_map");
    }
}
