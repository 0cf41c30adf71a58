//! Lifecycle notifications.
//!
//! Observers are advisory. The pipeline hands events to a [`Notifier`],
//! which fans them out synchronously and swallows anything an observer does
//! wrong, panics included. Observers must return quickly.

mod status;

pub use status::{CurrentTask, StatusSnapshot, StatusTracker, TaskStats};

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

/// Free-form attributes attached to an event.
pub type Attributes = BTreeMap<String, Value>;

/// Named lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    Disconnected,
    TaskReceived,
    TaskStarted,
    Step,
    TaskCompleted,
    TaskFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connecting => "connecting",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::TaskReceived => "task_received",
            EventKind::TaskStarted => "task_started",
            EventKind::Step => "step",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskFailed => "task_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverEvent {
    pub kind: EventKind,
    pub attributes: Attributes,
}

impl ObserverEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            attributes: Attributes::new(),
        }
    }

    /// Attach an attribute.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn str_attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn u64_attr(&self, key: &str) -> Option<u64> {
        self.attributes.get(key).and_then(Value::as_u64)
    }
}

/// Receives lifecycle events.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &ObserverEvent);
}

/// Fan-out to registered observers. Cheap to clone.
#[derive(Clone, Default)]
pub struct Notifier {
    observers: Vec<Arc<dyn Observer>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn emit(&self, event: ObserverEvent) {
        for observer in &self.observers {
            let delivered = catch_unwind(AssertUnwindSafe(|| observer.notify(&event)));
            if delivered.is_err() {
                warn!(event = %event.kind, "Observer panicked, ignoring");
            }
        }
    }

    /// Shorthand for a `step` event.
    pub fn step(&self, task_id: &str, step: &str) {
        self.emit(
            ObserverEvent::new(EventKind::Step)
                .with("task_id", task_id)
                .with("step", step),
        );
    }
}

/// Mirrors events into the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn notify(&self, event: &ObserverEvent) {
        let attributes = serde_json::to_string(&event.attributes).unwrap_or_default();
        match event.kind {
            EventKind::Step => debug!(event = %event.kind, attributes = %attributes, "Observer event"),
            EventKind::TaskFailed | EventKind::Disconnected => {
                warn!(event = %event.kind, attributes = %attributes, "Observer event")
            }
            _ => info!(event = %event.kind, attributes = %attributes, "Observer event"),
        }
    }
}
