//! In-process typed event bus.
//!
//! Subscribers register per [`EventKind`] and are invoked synchronously, in
//! registration order, on the publisher's task. Each subscriber is isolated:
//! a returned error or a panic is logged and the remaining subscribers still
//! run. Publishing never fails.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::motivation::{Intensity, MotivationStatus};
use crate::needs::NeedType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    NeedUpdated,
    NeedReset,
    NeedBlocked,
    NeedUnblocked,
    MotivationCreated,
    MotivationUpdated,
    MotivationThresholdReached,
    MotivationStatusChanged,
    MotivationExecuted,
    CharacterActivity,
    EmotionalStateChanged,
    SchedulerExecution,
    MonitoringError,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::NeedUpdated => "need.updated",
            EventKind::NeedReset => "need.reset",
            EventKind::NeedBlocked => "need.blocked",
            EventKind::NeedUnblocked => "need.unblocked",
            EventKind::MotivationCreated => "motivation.created",
            EventKind::MotivationUpdated => "motivation.updated",
            EventKind::MotivationThresholdReached => "motivation.threshold_reached",
            EventKind::MotivationStatusChanged => "motivation.status.changed",
            EventKind::MotivationExecuted => "motivation.executed",
            EventKind::CharacterActivity => "character.activity",
            EventKind::EmotionalStateChanged => "emotional_state.changed",
            EventKind::SchedulerExecution => "scheduler.execution",
            EventKind::MonitoringError => "monitoring.error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    NeedUpdated {
        character_id: i64,
        need_type: NeedType,
        old_value: f64,
        new_value: f64,
        reason: String,
    },
    NeedReset {
        character_id: i64,
        need_type: NeedType,
        old_value: f64,
    },
    NeedBlocked {
        character_id: i64,
        need_type: NeedType,
        blocked_until: DateTime<Utc>,
        reason: String,
    },
    NeedUnblocked {
        character_id: i64,
        need_type: NeedType,
    },
    MotivationCreated {
        character_id: i64,
        motivation_id: String,
        related_need: NeedType,
        intensity: Intensity,
        description: String,
    },
    MotivationUpdated {
        character_id: i64,
        motivation_id: String,
        old_value: f64,
        new_value: f64,
        status: MotivationStatus,
    },
    MotivationThresholdReached {
        character_id: i64,
        motivation_id: String,
        related_need: NeedType,
        value: f64,
        threshold: f64,
        description: String,
    },
    MotivationStatusChanged {
        character_id: i64,
        motivation_id: String,
        from: MotivationStatus,
        to: MotivationStatus,
    },
    MotivationExecuted {
        character_id: i64,
        motivation_id: String,
        related_need: NeedType,
        success: bool,
    },
    CharacterActivity {
        character_id: i64,
        activity: String,
        response_time_ms: Option<f64>,
    },
    EmotionalStateChanged {
        character_id: i64,
        previous: String,
        current: String,
    },
    SchedulerExecution {
        job: String,
        character_id: Option<i64>,
        success: bool,
        duration_ms: f64,
        error: Option<String>,
    },
    MonitoringError {
        character_id: Option<i64>,
        source: String,
        message: String,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::NeedUpdated { .. } => EventKind::NeedUpdated,
            DomainEvent::NeedReset { .. } => EventKind::NeedReset,
            DomainEvent::NeedBlocked { .. } => EventKind::NeedBlocked,
            DomainEvent::NeedUnblocked { .. } => EventKind::NeedUnblocked,
            DomainEvent::MotivationCreated { .. } => EventKind::MotivationCreated,
            DomainEvent::MotivationUpdated { .. } => EventKind::MotivationUpdated,
            DomainEvent::MotivationThresholdReached { .. } => {
                EventKind::MotivationThresholdReached
            }
            DomainEvent::MotivationStatusChanged { .. } => EventKind::MotivationStatusChanged,
            DomainEvent::MotivationExecuted { .. } => EventKind::MotivationExecuted,
            DomainEvent::CharacterActivity { .. } => EventKind::CharacterActivity,
            DomainEvent::EmotionalStateChanged { .. } => EventKind::EmotionalStateChanged,
            DomainEvent::SchedulerExecution { .. } => EventKind::SchedulerExecution,
            DomainEvent::MonitoringError { .. } => EventKind::MonitoringError,
        }
    }

    pub fn character_id(&self) -> Option<i64> {
        match self {
            DomainEvent::NeedUpdated { character_id, .. }
            | DomainEvent::NeedReset { character_id, .. }
            | DomainEvent::NeedBlocked { character_id, .. }
            | DomainEvent::NeedUnblocked { character_id, .. }
            | DomainEvent::MotivationCreated { character_id, .. }
            | DomainEvent::MotivationUpdated { character_id, .. }
            | DomainEvent::MotivationThresholdReached { character_id, .. }
            | DomainEvent::MotivationStatusChanged { character_id, .. }
            | DomainEvent::MotivationExecuted { character_id, .. }
            | DomainEvent::CharacterActivity { character_id, .. }
            | DomainEvent::EmotionalStateChanged { character_id, .. } => Some(*character_id),
            DomainEvent::SchedulerExecution { character_id, .. }
            | DomainEvent::MonitoringError { character_id, .. } => *character_id,
        }
    }
}

pub type Subscriber = Arc<dyn Fn(&DomainEvent) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    name: String,
    handler: Subscriber,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for one event kind. `name` only appears in logs.
    pub fn subscribe<F>(&self, kind: EventKind, name: &str, handler: F)
    where
        F: Fn(&DomainEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe_many(&[kind], name, handler);
    }

    /// Register one handler for several kinds.
    pub fn subscribe_many<F>(&self, kinds: &[EventKind], name: &str, handler: F)
    where
        F: Fn(&DomainEvent) -> Result<()> + Send + Sync + 'static,
    {
        let handler: Subscriber = Arc::new(handler);
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for kind in kinds {
            subscribers.entry(*kind).or_default().push(Subscription {
                name: name.to_string(),
                handler: handler.clone(),
            });
            tracing::debug!("Subscribed '{}' to {}", name, kind.as_str());
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Deliver `event` to every subscriber of its kind.
    ///
    /// Returns the number of subscribers that handled it without error.
    pub fn publish(&self, event: DomainEvent) -> usize {
        let kind = event.kind();
        // Snapshot the list so handlers may publish or subscribe re-entrantly.
        let targets = {
            let subscribers = self
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match subscribers.get(&kind) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for subscription in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.handler)(&event)));
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!(
                    "Subscriber '{}' failed on {}: {:#}",
                    subscription.name,
                    kind.as_str(),
                    e
                ),
                Err(_) => tracing::error!(
                    "Subscriber '{}' panicked on {}",
                    subscription.name,
                    kind.as_str()
                ),
            }
        }
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn activity(character_id: i64) -> DomainEvent {
        DomainEvent::CharacterActivity {
            character_id,
            activity: "message".to_string(),
            response_time_ms: Some(120.0),
        }
    }

    #[test]
    fn subscribers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(EventKind::CharacterActivity, label, move |_| {
                seen.lock().unwrap().push(label);
                Ok(())
            });
        }

        assert_eq!(bus.publish(activity(1)), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(0));

        bus.subscribe(EventKind::CharacterActivity, "fails", |_| {
            anyhow::bail!("metrics store offline")
        });
        bus.subscribe(EventKind::CharacterActivity, "panics", |_| {
            panic!("subscriber bug");
        });
        let counter = reached.clone();
        bus.subscribe(EventKind::CharacterActivity, "healthy", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        assert_eq!(bus.publish(activity(7)), 1);
        assert_eq!(*reached.lock().unwrap(), 1);
    }

    #[test]
    fn events_only_reach_subscribers_of_their_kind() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        bus.subscribe_many(
            &[EventKind::NeedReset, EventKind::MonitoringError],
            "multi",
            move |event| {
                sink.lock().unwrap().push(event.kind());
                Ok(())
            },
        );

        assert_eq!(bus.publish(activity(1)), 0);
        bus.publish(DomainEvent::NeedReset {
            character_id: 1,
            need_type: NeedType::Fun,
            old_value: 40.0,
        });
        bus.publish(DomainEvent::MonitoringError {
            character_id: None,
            source: "test".to_string(),
            message: "boom".to_string(),
        });

        assert_eq!(
            *hits.lock().unwrap(),
            vec![EventKind::NeedReset, EventKind::MonitoringError]
        );
        assert_eq!(bus.subscriber_count(EventKind::NeedReset), 1);
        assert_eq!(bus.subscriber_count(EventKind::NeedUpdated), 0);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let value = serde_json::to_value(activity(3)).unwrap();
        assert_eq!(value["type"], "character_activity");
        assert_eq!(value["character_id"], 3);
    }
}
