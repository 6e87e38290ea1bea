//! Lifecycle events.
//!
//! The coordinator reports what it does (tasks starting and failing, the
//! shutdown sequence) as [`LifecycleEvent`]s to an [`EventSink`].
//!
//! | Event                            | Fields                                     |
//! |----------------------------------|--------------------------------------------|
//! | `coordinator.task_started`       | `task`                                     |
//! | `coordinator.task_failed`        | `task`, `error`                            |
//! | `coordinator.shutdown_started`   | `cause`, `label`, `cleanups`               |
//! | `coordinator.cleanup_failed`     | `cleanup`, `error`                         |
//! | `coordinator.shutdown_completed` | `cause`, `cleanup_failures`, `duration_ms` |

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn, Level};

/// Task started.
pub const TASK_STARTED: &str = "coordinator.task_started";
/// Task returned an error or panicked.
pub const TASK_FAILED: &str = "coordinator.task_failed";
/// Scope cancelled, cleanup about to run.
pub const SHUTDOWN_STARTED: &str = "coordinator.shutdown_started";
/// One cleanup callable failed.
pub const CLEANUP_FAILED: &str = "coordinator.cleanup_failed";
/// All cleanups collected and all tasks exited.
pub const SHUTDOWN_COMPLETED: &str = "coordinator.shutdown_completed";

/// Something that happened during a coordinator's lifetime.
///
/// Serializes to a flat JSON object tagged with `"event"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A task was spawned.
    TaskStarted {
        /// Task name.
        task: String,
    },
    /// A task returned an error or panicked.
    TaskFailed {
        /// Task name.
        task: String,
        /// The resulting shutdown cause, rendered.
        error: String,
    },
    /// The scope was cancelled and cleanup is about to run.
    ShutdownStarted {
        /// The cause, rendered.
        cause: String,
        /// Short cause label, see [`ShutdownCause::as_label`](crate::ShutdownCause::as_label).
        label: &'static str,
        /// Number of registered cleanup callables.
        cleanups: usize,
    },
    /// A cleanup callable failed, panicked or timed out.
    CleanupFailed {
        /// Cleanup name.
        cleanup: String,
        /// What went wrong.
        error: String,
    },
    /// Cleanup finished and every task exited.
    ShutdownCompleted {
        /// The cause, rendered.
        cause: String,
        /// Number of failed cleanup callables.
        cleanup_failures: usize,
        /// Time from cancellation observed to completion.
        duration_ms: u64,
    },
}

impl LifecycleEvent {
    /// Returns the dotted event type, e.g. `coordinator.task_failed`.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => TASK_STARTED,
            Self::TaskFailed { .. } => TASK_FAILED,
            Self::ShutdownStarted { .. } => SHUTDOWN_STARTED,
            Self::CleanupFailed { .. } => CLEANUP_FAILED,
            Self::ShutdownCompleted { .. } => SHUTDOWN_COMPLETED,
        }
    }

    /// Returns true for events reporting a failure.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::TaskFailed { .. } | Self::CleanupFailed { .. })
    }

    /// Renders the event as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Receives lifecycle events from a coordinator.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event, possibly waiting on I/O.
    async fn emit(&self, event: LifecycleEvent);

    /// Delivers an event from synchronous code without blocking.
    ///
    /// Must never panic; errors are logged and suppressed.
    fn try_emit(&self, event: LifecycleEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: LifecycleEvent) {}

    fn try_emit(&self, _event: LifecycleEvent) {}
}

/// Logs events through `tracing`.
///
/// Failures are always logged at `WARN`; everything else at the configured
/// level (`INFO` by default).
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging non-failure events at `level`.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    fn log_event(&self, event: &LifecycleEvent) {
        let data = event.to_json();
        if event.is_failure() {
            warn!(event_type = event.event_type(), event_data = %data, "Lifecycle event");
        } else if self.level == Level::DEBUG || self.level == Level::TRACE {
            debug!(event_type = event.event_type(), event_data = %data, "Lifecycle event");
        } else {
            info!(event_type = event.event_type(), event_data = %data, "Lifecycle event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }
}

/// Keeps every event in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<LifecycleEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing has been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the events with the given dotted type.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.try_emit(event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn started(task: &str) -> LifecycleEvent {
        LifecycleEvent::TaskStarted {
            task: task.to_string(),
        }
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = LifecycleEvent::ShutdownStarted {
            cause: "exit signal received".to_string(),
            label: "signal",
            cleanups: 2,
        };
        assert_eq!(event.event_type(), SHUTDOWN_STARTED);
        assert_eq!(
            event.to_json(),
            json!({
                "event": "shutdown_started",
                "cause": "exit signal received",
                "label": "signal",
                "cleanups": 2,
            })
        );
    }

    #[test]
    fn test_failure_events() {
        let failed = LifecycleEvent::CleanupFailed {
            cleanup: "flush".to_string(),
            error: "disk full".to_string(),
        };
        assert!(failed.is_failure());
        assert!(!started("a").is_failure());
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks_accept_events() {
        NoOpEventSink.emit(started("a")).await;
        LoggingEventSink::new(Level::DEBUG).emit(started("a")).await;
        LoggingEventSink::default().try_emit(LifecycleEvent::TaskFailed {
            task: "a".to_string(),
            error: "boom".to_string(),
        });
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_type() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(started("a")).await;
        sink.try_emit(started("b"));
        sink.try_emit(LifecycleEvent::TaskFailed {
            task: "b".to_string(),
            error: "boom".to_string(),
        });

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.of_type(TASK_STARTED), vec![started("a"), started("b")]);
        assert_eq!(sink.of_type(TASK_FAILED).len(), 1);
        assert!(sink.of_type(SHUTDOWN_COMPLETED).is_empty());
    }
}
