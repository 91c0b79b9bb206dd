//! Event sink trait and implementations.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, Level};

/// Receives engine lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "step.started")
    /// * `data` - Optional event data
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event without blocking. Never fails; errors are logged and
    /// suppressed.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to `tracing` under the `etlflow::events` target.
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
    /// Creates a logging sink at `level`; anything other than DEBUG logs
    /// at INFO.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        let data = data.map(Value::to_string).unwrap_or_default();
        if self.level == Level::DEBUG {
            debug!(target: "etlflow::events", event = %event_type, data = %data, "{event_type}");
        } else {
            info!(target: "etlflow::events", event = %event_type, data = %data, "{event_type}");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.events.read().clone()
    }

    /// Returns the collected event types in order.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.events.read().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<(String, Option<Value>)> {
        self.events
            .read()
            .iter()
            .filter(|(t, _)| t.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.try_emit(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push((event_type.to_string(), data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_logging_sink_does_not_panic() {
        let sink = LoggingEventSink::debug();
        sink.emit("step.started", Some(json!({"step": "a"}))).await;
        sink.try_emit("step.completed", None);
        NoOpEventSink.try_emit("ignored", None);
    }

    #[tokio::test]
    async fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit("step.started", None).await;
        sink.emit("step.completed", Some(json!({"rows": 3}))).await;
        sink.try_emit("run.completed", None);

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("step.").len(), 2);
        assert_eq!(sink.types(), vec!["step.started", "step.completed", "run.completed"]);
        assert_eq!(sink.events()[1].1, Some(json!({"rows": 3})));
    }
}
