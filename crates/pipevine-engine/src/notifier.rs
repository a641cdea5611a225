//! Lifecycle event fan-out to named sinks.
//!
//! Sinks are side-effect-only; a failing sink is recorded in its dispatch
//! result and never affects pipeline status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use pipevine_types::RunStatus;

/// One configured notification target.
///
/// `sink` selects the registered sink by name; `on` lists the events to
/// deliver. Remaining fields are sink-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(rename = "type")]
    pub sink: String,
    #[serde(default)]
    pub on: Vec<String>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, Value>,
}

/// The event handed to sinks.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub event: String,
    pub pipeline: String,
    pub execution_id: String,
    pub status: Option<RunStatus>,
    pub task_id: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationContext {
    /// New event for a run, stamped now.
    #[must_use]
    pub fn new(event: impl Into<String>, pipeline: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            pipeline: pipeline.into(),
            execution_id: execution_id.into(),
            status: None,
            task_id: None,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// Result of one sink dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct SinkDispatchResult {
    pub success: bool,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A named delivery target.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message on delivery failure; the caller
    /// records it and moves on.
    fn send(&self, config: &NotificationConfig, ctx: &NotificationContext) -> Result<(), String>;
}

/// Registry of named sinks.
#[derive(Default)]
pub struct Notifier {
    sinks: HashMap<String, Arc<dyn NotificationSink>>,
}

impl Notifier {
    /// Empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifier preloaded with the built-in `log` sink.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut notifier = Self::new();
        notifier.register(Arc::new(LogSink));
        notifier
    }

    /// Register a sink under its own name, replacing any previous one.
    pub fn register(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    /// Dispatch one event to the sink named by `config`.
    ///
    /// Returns an empty list when the event is not in `config.on` (silent
    /// skip) or the sink type is unknown (warning).
    #[must_use]
    pub fn send(
        &self,
        config: &NotificationConfig,
        ctx: &NotificationContext,
    ) -> Vec<SinkDispatchResult> {
        if !config.on.iter().any(|e| e == &ctx.event) {
            return Vec::new();
        }
        let Some(sink) = self.sinks.get(&config.sink) else {
            tracing::warn!(sink = config.sink, "unknown notification sink type");
            return Vec::new();
        };

        let start = Instant::now();
        let outcome = sink.send(config, ctx);
        let duration_ms = start.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(()) => SinkDispatchResult {
                success: true,
                service: config.sink.clone(),
                error: None,
                duration_ms,
            },
            Err(message) => {
                tracing::warn!(
                    sink = config.sink,
                    event = ctx.event,
                    "notification delivery failed: {message}"
                );
                SinkDispatchResult {
                    success: false,
                    service: config.sink.clone(),
                    error: Some(message),
                    duration_ms,
                }
            }
        };
        vec![result]
    }
}

/// Built-in sink that writes events to the log.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn send(&self, _config: &NotificationConfig, ctx: &NotificationContext) -> Result<(), String> {
        tracing::info!(
            event = ctx.event,
            pipeline = ctx.pipeline,
            execution_id = ctx.execution_id,
            status = ctx.status.map(|s| s.as_str()),
            task = ctx.task_id.as_deref(),
            error = ctx.error.as_deref(),
            "pipeline event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        delivered: AtomicUsize,
        fail: bool,
    }

    impl NotificationSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        fn send(
            &self,
            _config: &NotificationConfig,
            _ctx: &NotificationContext,
        ) -> Result<(), String> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("delivery refused".into())
            } else {
                Ok(())
            }
        }
    }

    fn config(on: &[&str]) -> NotificationConfig {
        NotificationConfig {
            sink: "counting".into(),
            on: on.iter().map(|&s| s.into()).collect(),
            params: serde_json::Map::new(),
        }
    }

    #[test]
    fn event_not_subscribed_is_skipped_silently() {
        let mut notifier = Notifier::new();
        let sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
            fail: false,
        });
        notifier.register(sink.clone());

        let ctx = NotificationContext::new("pipeline.failed", "etl", "run-1");
        let results = notifier.send(&config(&["pipeline.completed"]), &ctx);
        assert!(results.is_empty());
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribed_event_delivers_with_duration() {
        let mut notifier = Notifier::new();
        notifier.register(Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
            fail: false,
        }));

        let ctx = NotificationContext::new("pipeline.completed", "etl", "run-1");
        let results = notifier.send(&config(&["pipeline.completed"]), &ctx);
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].service, "counting");
    }

    #[test]
    fn sink_failure_recorded_not_raised() {
        let mut notifier = Notifier::new();
        notifier.register(Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
            fail: true,
        }));

        let ctx = NotificationContext::new("task.failed", "etl", "run-1");
        let results = notifier.send(&config(&["task.failed"]), &ctx);
        assert!(!results[0].success);
        assert_eq!(results[0].error.as_deref(), Some("delivery refused"));
    }

    #[test]
    fn unknown_sink_type_returns_empty() {
        let notifier = Notifier::with_builtins();
        let ctx = NotificationContext::new("pipeline.completed", "etl", "run-1");
        let unknown = NotificationConfig {
            sink: "pager".into(),
            on: vec!["pipeline.completed".into()],
            params: serde_json::Map::new(),
        };
        assert!(notifier.send(&unknown, &ctx).is_empty());
    }

    #[test]
    fn log_sink_always_succeeds() {
        let notifier = Notifier::with_builtins();
        let ctx = NotificationContext::new("pipeline.completed", "etl", "run-1");
        let log = NotificationConfig {
            sink: "log".into(),
            on: vec!["pipeline.completed".into()],
            params: serde_json::Map::new(),
        };
        let results = notifier.send(&log, &ctx);
        assert!(results[0].success);
    }
}
