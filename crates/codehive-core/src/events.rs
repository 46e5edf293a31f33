//! Publish/subscribe bus for hierarchy and cycle events
//!
//! Sinks are fire-and-forget: publishing never fails and never waits on a
//! subscriber. Listeners register for one [`EventKind`] or for everything.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;

use crate::cycle::{Cycle, DecisionPoint, Phase, Query};
use crate::types::{DependencyEdge, DependencyLevel, Epic, Instruction, Story, Task};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    EpicCreated(Epic),
    EpicUpdated(Epic),
    EpicDeleted { id: String },
    StoryCreated(Story),
    StoryUpdated(Story),
    StoryDeleted { id: String },
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted { id: String },
    InstructionCreated(Instruction),
    InstructionUpdated(Instruction),
    InstructionDeleted { id: String },
    DependencyAdded(DependencyEdge),
    DependencyRemoved { level: DependencyLevel, id: String },
    CycleStarted(Cycle),
    PhaseCompleted { cycle_id: String, phase: Phase, next_phase: Phase },
    CycleBlocked { cycle_id: String, query_ids: Vec<String> },
    CycleResumed { cycle_id: String },
    CycleCompleted { cycle_id: String, merge_request_url: Option<String> },
    CycleFailed { cycle_id: String, reason: String },
    QueryRaised(Query),
    QueryAnswered(Query),
    DecisionPoint { cycle_id: String, phase: Phase, decision: DecisionPoint },
}

/// Discriminant used to route events to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    EpicCreated,
    EpicUpdated,
    EpicDeleted,
    StoryCreated,
    StoryUpdated,
    StoryDeleted,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    InstructionCreated,
    InstructionUpdated,
    InstructionDeleted,
    DependencyAdded,
    DependencyRemoved,
    CycleStarted,
    PhaseCompleted,
    CycleBlocked,
    CycleResumed,
    CycleCompleted,
    CycleFailed,
    QueryRaised,
    QueryAnswered,
    DecisionPoint,
}

impl EventKind {
    /// Wire name, e.g. `epic:created`
    pub fn name(&self) -> &'static str {
        match self {
            Self::EpicCreated => "epic:created",
            Self::EpicUpdated => "epic:updated",
            Self::EpicDeleted => "epic:deleted",
            Self::StoryCreated => "story:created",
            Self::StoryUpdated => "story:updated",
            Self::StoryDeleted => "story:deleted",
            Self::TaskCreated => "task:created",
            Self::TaskUpdated => "task:updated",
            Self::TaskDeleted => "task:deleted",
            Self::InstructionCreated => "instruction:created",
            Self::InstructionUpdated => "instruction:updated",
            Self::InstructionDeleted => "instruction:deleted",
            Self::DependencyAdded => "dependency:added",
            Self::DependencyRemoved => "dependency:removed",
            Self::CycleStarted => "cycle:started",
            Self::PhaseCompleted => "cycle:phase_completed",
            Self::CycleBlocked => "cycle:blocked",
            Self::CycleResumed => "cycle:resumed",
            Self::CycleCompleted => "cycle:completed",
            Self::CycleFailed => "cycle:failed",
            Self::QueryRaised => "query:raised",
            Self::QueryAnswered => "query:answered",
            Self::DecisionPoint => "cycle:decision_point",
        }
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::EpicCreated(_) => EventKind::EpicCreated,
            Self::EpicUpdated(_) => EventKind::EpicUpdated,
            Self::EpicDeleted { .. } => EventKind::EpicDeleted,
            Self::StoryCreated(_) => EventKind::StoryCreated,
            Self::StoryUpdated(_) => EventKind::StoryUpdated,
            Self::StoryDeleted { .. } => EventKind::StoryDeleted,
            Self::TaskCreated(_) => EventKind::TaskCreated,
            Self::TaskUpdated(_) => EventKind::TaskUpdated,
            Self::TaskDeleted { .. } => EventKind::TaskDeleted,
            Self::InstructionCreated(_) => EventKind::InstructionCreated,
            Self::InstructionUpdated(_) => EventKind::InstructionUpdated,
            Self::InstructionDeleted { .. } => EventKind::InstructionDeleted,
            Self::DependencyAdded(_) => EventKind::DependencyAdded,
            Self::DependencyRemoved { .. } => EventKind::DependencyRemoved,
            Self::CycleStarted(_) => EventKind::CycleStarted,
            Self::PhaseCompleted { .. } => EventKind::PhaseCompleted,
            Self::CycleBlocked { .. } => EventKind::CycleBlocked,
            Self::CycleResumed { .. } => EventKind::CycleResumed,
            Self::CycleCompleted { .. } => EventKind::CycleCompleted,
            Self::CycleFailed { .. } => EventKind::CycleFailed,
            Self::QueryRaised(_) => EventKind::QueryRaised,
            Self::QueryAnswered(_) => EventKind::QueryAnswered,
            Self::DecisionPoint { .. } => EventKind::DecisionPoint,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

/// Receiver of published events
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &Event);
}

impl<F> EventSink for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn publish(&self, event: &Event) {
        self(event)
    }
}

#[derive(Default)]
struct Subscribers {
    by_kind: HashMap<EventKind, Vec<Arc<dyn EventSink>>>,
    all: Vec<Arc<dyn EventSink>>,
}

/// Cloneable handle to a shared set of listeners
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<RwLock<Subscribers>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen to one kind of event
    pub fn subscribe(&self, kind: EventKind, sink: Arc<dyn EventSink>) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.by_kind.entry(kind).or_default().push(sink);
    }

    /// Listen to every event
    pub fn subscribe_all(&self, sink: Arc<dyn EventSink>) {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.all.push(sink);
    }

    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        debug!(event = kind.name(), "publishing event");

        // Snapshot the listener list so sinks may subscribe re-entrantly
        let sinks: Vec<Arc<dyn EventSink>> = {
            let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            subs.by_kind
                .get(&kind)
                .into_iter()
                .flatten()
                .chain(subs.all.iter())
                .cloned()
                .collect()
        };

        for sink in sinks {
            sink.publish(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        let subs = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        subs.all.len() + subs.by_kind.values().map(Vec::len).sum::<usize>()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Forwards events to a tokio broadcast channel for connected clients
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Event>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &Event) {
        // No connected receivers is not an error
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, Arc<dyn EventSink>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Arc<dyn EventSink> = Arc::new(move |event: &Event| {
            sink_seen.lock().unwrap().push(event.name());
        });
        (seen, sink)
    }

    #[test]
    fn test_kind_subscriber_only_sees_its_kind() {
        let bus = EventBus::new();
        let (seen, sink) = recorder();
        bus.subscribe(EventKind::EpicDeleted, sink);

        bus.publish(Event::StoryDeleted { id: "s1".into() });
        bus.publish(Event::EpicDeleted { id: "e1".into() });

        assert_eq!(*seen.lock().unwrap(), vec!["epic:deleted"]);
    }

    #[test]
    fn test_wildcard_subscriber_sees_everything() {
        let bus = EventBus::new();
        let (seen, sink) = recorder();
        bus.subscribe_all(sink);

        bus.publish(Event::TaskDeleted { id: "t1".into() });
        bus.publish(Event::CycleResumed { cycle_id: "c1".into() });

        assert_eq!(*seen.lock().unwrap(), vec!["task:deleted", "cycle:resumed"]);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_publish_without_listeners_is_noop() {
        let bus = EventBus::new();
        bus.publish(Event::EpicDeleted { id: "e1".into() });
        assert_eq!(bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_receivers() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        let bus = EventBus::new();
        bus.subscribe_all(Arc::new(sink));

        bus.publish(Event::CycleFailed {
            cycle_id: "c1".into(),
            reason: "boom".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::CycleFailed);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(Event::EpicDeleted { id: "e1".into() }).unwrap();
        assert_eq!(json["event"], "epic_deleted");
        assert_eq!(json["data"]["id"], "e1");
    }
}
