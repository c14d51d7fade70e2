use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use crate::runtime::ValueMap;

/// Messages longer than this have their JSON payload cut with an ellipsis.
const MAX_VALUES_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    #[serde(rename = "Task.Started")]
    TaskStarted,
    #[serde(rename = "Task.Finished")]
    TaskFinished,
    #[serde(rename = "Flow.StateChanged")]
    FlowStateChanged,
    #[serde(rename = "Flow.Started")]
    FlowStarted,
    #[serde(rename = "Flow.Finished")]
    FlowFinished,
    #[serde(rename = "Flow.Stopped")]
    FlowStopped,
    #[serde(rename = "Flow.Paused")]
    FlowPaused,
    General,
}

impl fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowEvent::TaskStarted => "Task.Started",
            FlowEvent::TaskFinished => "Task.Finished",
            FlowEvent::FlowStateChanged => "Flow.StateChanged",
            FlowEvent::FlowStarted => "Flow.Started",
            FlowEvent::FlowFinished => "Flow.Finished",
            FlowEvent::FlowStopped => "Flow.Stopped",
            FlowEvent::FlowPaused => "Flow.Paused",
            FlowEvent::General => "General",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub code: String,
    #[serde(rename = "type")]
    pub resolver: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogExtra {
    pub pid: Option<u64>,
    pub task: Option<TaskRef>,
    pub debug_id: Option<u64>,
    /// JSON of the values the message refers to.
    pub values: Option<String>,
}

/// A structured engine event, as handed to every registered `FlowLogger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowLogEntry {
    pub level: LogLevel,
    pub event_type: FlowEvent,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub object_id: Option<Uuid>,
    /// Caller supplied `RunOptions::log_fields`.
    #[serde(default)]
    pub fields: ValueMap,
    pub extra: LogExtra,
}

impl FlowLogEntry {
    pub fn new(level: LogLevel, event_type: FlowEvent, message: impl Into<String>) -> Self {
        Self {
            level,
            event_type,
            message: message.into(),
            timestamp: Utc::now(),
            object_id: None,
            fields: ValueMap::new(),
            extra: LogExtra::default(),
        }
    }

    pub fn info(event_type: FlowEvent, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, event_type, message)
    }

    pub fn debug(event_type: FlowEvent, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug, event_type, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, FlowEvent::General, message)
    }

    /// Appends the JSON of `values` to the message, and keeps the full JSON
    /// in `extra.values`.
    pub fn with_values(mut self, values: &Value) -> Self {
        let json = values.to_string();
        self.message = format!("{}: {}", self.message, truncate(&json));
        self.extra.values = Some(json);
        self
    }

    pub fn with_task(mut self, code: &str, resolver: &str, pid: u64) -> Self {
        self.extra.task = Some(TaskRef {
            code: code.to_string(),
            resolver: resolver.to_string(),
        });
        self.extra.pid = Some(pid);
        self
    }

    /// Forwards the entry to `tracing` at the matching level.
    pub fn trace_event(&self) {
        let flow_id = self.extra.debug_id.unwrap_or_default();
        let task = self.extra.task.as_ref().map(|t| t.code.as_str()).unwrap_or("");
        let event = self.event_type;
        match self.level {
            LogLevel::Fatal | LogLevel::Error => error!(flow_id, %event, task, "{}", self.message),
            LogLevel::Warning => warn!(flow_id, %event, task, "{}", self.message),
            LogLevel::Info => info!(flow_id, %event, task, "{}", self.message),
            LogLevel::Debug => debug!(flow_id, %event, task, "{}", self.message),
            LogLevel::Trace => trace!(flow_id, %event, task, "{}", self.message),
        }
    }
}

fn truncate(json: &str) -> String {
    if json.chars().count() > MAX_VALUES_LEN {
        let cut: String = json.chars().take(MAX_VALUES_LEN - 3).collect();
        format!("{}...", cut)
    } else {
        json.to_string()
    }
}

/// Sink for engine events. Implementations must not block.
pub trait FlowLogger: Send + Sync {
    fn log(&self, entry: &FlowLogEntry);
}
