//! In-memory metrics collector fed by the event bus.
//!
//! Nothing here is persisted; counters reset when the process restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::events::{DomainEvent, EventBus, EventKind};

pub const EVENT_BUFFER_CAPACITY: usize = 1000;
pub const LATENCY_WINDOW: usize = 100;
pub const EVENT_RETENTION_HOURS: i64 = 24;

const MONITORED_KINDS: [EventKind; 5] = [
    EventKind::CharacterActivity,
    EventKind::EmotionalStateChanged,
    EventKind::MotivationExecuted,
    EventKind::SchedulerExecution,
    EventKind::MonitoringError,
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CharacterMetrics {
    pub character_id: i64,
    pub message_count: u64,
    pub emotional_state_changes: u64,
    pub motivation_executions: u64,
    pub motivation_successes: u64,
    pub error_count: u64,
    pub scheduler_executions: u64,
    pub average_response_time_ms: f64,
    pub response_samples: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl CharacterMetrics {
    fn new(character_id: i64) -> Self {
        Self {
            character_id,
            ..Self::default()
        }
    }

    fn observe_response_time(&mut self, millis: f64) {
        self.response_samples += 1;
        self.average_response_time_ms +=
            (millis - self.average_response_time_ms) / self.response_samples as f64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GlobalCounters {
    pub messages: u64,
    pub emotional_state_changes: u64,
    pub motivation_executions: u64,
    pub motivation_successes: u64,
    pub errors: u64,
    pub scheduler_executions: u64,
    pub scheduler_successes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    pub recorded_at: DateTime<Utc>,
    pub kind: &'static str,
    pub character_id: Option<i64>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringReport {
    pub generated_at: DateTime<Utc>,
    pub counters: GlobalCounters,
    pub scheduler_success_rate: f64,
    pub average_scheduler_latency_ms: f64,
    pub characters: Vec<CharacterMetrics>,
    pub buffered_events: usize,
}

#[derive(Default)]
struct MonitoringState {
    characters: HashMap<i64, CharacterMetrics>,
    counters: GlobalCounters,
    events: VecDeque<RecordedEvent>,
    scheduler_latencies: VecDeque<f64>,
}

impl MonitoringState {
    fn character(&mut self, character_id: i64) -> &mut CharacterMetrics {
        self.characters
            .entry(character_id)
            .or_insert_with(|| CharacterMetrics::new(character_id))
    }
}

#[derive(Default)]
pub struct MonitoringCollector {
    state: Mutex<MonitoringState>,
}

impl MonitoringCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe the collector to every monitored event kind.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let collector = Arc::clone(self);
        bus.subscribe_many(&MONITORED_KINDS, "monitoring", move |event| {
            collector.record(event);
            Ok(())
        });
    }

    pub fn record(&self, event: &DomainEvent) {
        self.record_at(event, Utc::now());
    }

    /// Fold one event into the counters and the ring buffer. Event kinds the
    /// collector does not track are ignored.
    pub fn record_at(&self, event: &DomainEvent, now: DateTime<Utc>) {
        let mut state = self.lock_state();

        match event {
            DomainEvent::CharacterActivity {
                character_id,
                response_time_ms,
                ..
            } => {
                state.counters.messages += 1;
                let metrics = state.character(*character_id);
                metrics.message_count += 1;
                metrics.last_activity = Some(now);
                if let Some(millis) = response_time_ms.filter(|ms| ms.is_finite() && *ms >= 0.0) {
                    metrics.observe_response_time(millis);
                }
            }
            DomainEvent::EmotionalStateChanged { character_id, .. } => {
                state.counters.emotional_state_changes += 1;
                state.character(*character_id).emotional_state_changes += 1;
            }
            DomainEvent::MotivationExecuted {
                character_id,
                success,
                ..
            } => {
                state.counters.motivation_executions += 1;
                if *success {
                    state.counters.motivation_successes += 1;
                }
                let metrics = state.character(*character_id);
                metrics.motivation_executions += 1;
                if *success {
                    metrics.motivation_successes += 1;
                }
            }
            DomainEvent::SchedulerExecution {
                character_id,
                success,
                duration_ms,
                ..
            } => match character_id {
                // Per-character slices of a job run; the run itself is counted once.
                Some(id) => state.character(*id).scheduler_executions += 1,
                None => {
                    state.counters.scheduler_executions += 1;
                    if *success {
                        state.counters.scheduler_successes += 1;
                    }
                    state.scheduler_latencies.push_back(*duration_ms);
                    while state.scheduler_latencies.len() > LATENCY_WINDOW {
                        state.scheduler_latencies.pop_front();
                    }
                }
            },
            DomainEvent::MonitoringError { character_id, .. } => {
                state.counters.errors += 1;
                if let Some(id) = character_id {
                    state.character(*id).error_count += 1;
                }
            }
            _ => return,
        }

        let payload = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to serialize {} for monitoring: {}", event.kind().as_str(), e);
                serde_json::Value::Null
            }
        };
        state.events.push_back(RecordedEvent {
            recorded_at: now,
            kind: event.kind().as_str(),
            character_id: event.character_id(),
            payload,
        });
        while state.events.len() > EVENT_BUFFER_CAPACITY {
            state.events.pop_front();
        }
    }

    pub fn purge_old_events(&self) -> usize {
        self.purge_old_events_at(Utc::now())
    }

    /// Drop buffered events older than the retention window.
    pub fn purge_old_events_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - ChronoDuration::hours(EVENT_RETENTION_HOURS);
        let mut state = self.lock_state();
        let before = state.events.len();
        state.events.retain(|event| event.recorded_at >= cutoff);
        before - state.events.len()
    }

    /// Percentage of successful scheduler runs; 0 before the first run.
    pub fn scheduler_success_rate(&self) -> f64 {
        let state = self.lock_state();
        success_rate(&state.counters)
    }

    pub fn average_scheduler_latency_ms(&self) -> f64 {
        let state = self.lock_state();
        average(&state.scheduler_latencies)
    }

    pub fn character_metrics(&self, character_id: i64) -> Option<CharacterMetrics> {
        self.lock_state().characters.get(&character_id).cloned()
    }

    /// Up to `limit` buffered events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<RecordedEvent> {
        self.lock_state()
            .events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn report(&self) -> MonitoringReport {
        let state = self.lock_state();
        let mut characters = state.characters.values().cloned().collect::<Vec<_>>();
        characters.sort_by_key(|metrics| metrics.character_id);
        MonitoringReport {
            generated_at: Utc::now(),
            counters: state.counters.clone(),
            scheduler_success_rate: success_rate(&state.counters),
            average_scheduler_latency_ms: average(&state.scheduler_latencies),
            characters,
            buffered_events: state.events.len(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitoringState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn success_rate(counters: &GlobalCounters) -> f64 {
    if counters.scheduler_executions == 0 {
        return 0.0;
    }
    counters.scheduler_successes as f64 / counters.scheduler_executions as f64 * 100.0
}

fn average(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}
