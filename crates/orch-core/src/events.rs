//! Process-wide event sink for the structured observability stream that
//! runs alongside the execution trace (spec §4.K): every step transition
//! the trace recorder persists to disk is also emitted here, tagged with
//! a component identifier and a level, so the events can be consumed
//! without re-reading the trace file.
//!
//! Grounded on the teacher's `loop-core::events::EventPayload` +
//! `storage.append_event` call sites: that design appends a typed payload
//! to a SQLite-backed audit log after every phase transition. This system
//! has no database, so the sink is a small trait object (spec §9's design
//! note on testability) with a `tracing`-backed default implementation
//! and an in-memory recorder for tests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which of the components (A-N, spec §2) raised the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Component {
    StateStore,
    Host,
    Scm,
    Ticket,
    Worktree,
    AttemptGuard,
    Preflight,
    Security,
    Worker,
    Backend,
    Trace,
    Dispatcher,
    ResultChecker,
    Cleanup,
}

impl Component {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StateStore => "state_store",
            Self::Host => "host",
            Self::Scm => "scm",
            Self::Ticket => "ticket",
            Self::Worktree => "worktree",
            Self::AttemptGuard => "attempt_guard",
            Self::Preflight => "preflight",
            Self::Security => "security",
            Self::Worker => "worker",
            Self::Backend => "backend",
            Self::Trace => "trace",
            Self::Dispatcher => "dispatcher",
            Self::ResultChecker => "result_checker",
            Self::Cleanup => "cleanup",
        }
    }
}

/// Severity of an emitted event. Deliberately just the two levels spec
/// §4.K names; anything finer-grained belongs in `tracing` spans instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Error,
}

/// A single emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub issue_id: Option<u64>,
    pub component: Component,
    pub level: EventLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(component: Component, level: EventLevel, issue_id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            issue_id,
            component,
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// The process-wide sink interface. Kept deliberately small so it can be
/// stubbed in tests, per spec §9's note on representing global mutable
/// state as an explicit, injectable dependency.
pub trait EventSink: std::fmt::Debug + Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink: mirrors events into `tracing` at the matching level,
/// with the component name and issue id as structured fields.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        match event.level {
            EventLevel::Info => {
                tracing::info!(component = event.component.as_str(), issue_id = event.issue_id, "{}", event.message);
            }
            EventLevel::Error => {
                tracing::error!(component = event.component.as_str(), issue_id = event.issue_id, "{}", event.message);
            }
        }
    }
}

/// In-memory sink for tests and for `orchctl`-style inspection: buffers
/// every event it receives for later assertion.
#[derive(Debug, Default)]
pub struct RecordingEventSink(Mutex<Vec<Event>>);

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().expect("event sink mutex poisoned").clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: Event) {
        self.0.lock().expect("event sink mutex poisoned").push(event);
    }
}

/// Returns the process-wide default sink (a `TracingEventSink`), shared
/// across every `TraceRecorder` that isn't constructed with an explicit
/// sink via `TraceRecorder::start_with_sink`.
pub fn default_sink() -> Arc<dyn EventSink> {
    static DEFAULT: std::sync::OnceLock<Arc<dyn EventSink>> = std::sync::OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(TracingEventSink)).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_buffers_events_in_order() {
        let sink = RecordingEventSink::new();
        sink.emit(Event::new(Component::Worker, EventLevel::Info, Some(1), "started"));
        sink.emit(Event::new(Component::Worker, EventLevel::Error, Some(1), "failed"));
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "started");
        assert!(matches!(events[1].level, EventLevel::Error));
    }

    #[test]
    fn component_as_str_is_snake_case() {
        assert_eq!(Component::ResultChecker.as_str(), "result_checker");
        assert_eq!(Component::StateStore.as_str(), "state_store");
    }

    #[test]
    fn default_sink_is_stable_across_calls() {
        let a = default_sink();
        let b = default_sink();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
