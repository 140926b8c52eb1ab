//! JSON output for streaming task lifecycle events to stdout.

use serde::Serialize;
use std::io::{self, Write};

use chrono::{DateTime, Utc};
use scriptrun_core::{ClaimedTask, RunId, StatusCode, TaskId};

/// JSON event types that can be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonEventType {
    TaskClaimed,
    TaskReclaimed,
    TaskCompleted,
    Error,
}

/// A JSON event to be output to stdout.
#[derive(Debug, Clone, Serialize)]
pub struct JsonEvent {
    pub event: JsonEventType,
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl JsonEvent {
    /// Create a new JSON event with the current timestamp.
    pub fn new(event: JsonEventType, data: serde_json::Value) -> Self {
        Self {
            event,
            timestamp: Utc::now().to_rfc3339(),
            data,
        }
    }
}

/// Emits [`JsonEvent`]s as JSON lines when enabled, and does nothing
/// otherwise. Cheap to copy into every component that reports progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOutput {
    enabled: bool,
}

impl JsonOutput {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn emit(&self, event: JsonEvent) {
        if !self.enabled {
            return;
        }
        if let Ok(json) = serde_json::to_string(&event) {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout, "{}", json);
            let _ = stdout.flush();
        }
    }

    /// Emit a task_claimed event.
    pub fn task_claimed(&self, task: &ClaimedTask) {
        self.emit(task_claimed_event(task));
    }

    /// Emit a task_reclaimed event.
    pub fn task_reclaimed(&self, task_id: &TaskId, run_id: RunId, taken_until: DateTime<Utc>) {
        self.emit(JsonEvent::new(
            JsonEventType::TaskReclaimed,
            serde_json::json!({
                "task_id": task_id,
                "run_id": run_id,
                "taken_until": taken_until.to_rfc3339(),
            }),
        ));
    }

    /// Emit a task_completed event.
    pub fn task_completed(&self, task_id: &TaskId, run_id: RunId, status: StatusCode) {
        self.emit(task_completed_event(task_id, run_id, status));
    }

    /// Emit an error event.
    pub fn error(&self, message: &str) {
        self.emit(JsonEvent::new(
            JsonEventType::Error,
            serde_json::json!({ "message": message }),
        ));
    }
}

fn task_claimed_event(task: &ClaimedTask) -> JsonEvent {
    JsonEvent::new(
        JsonEventType::TaskClaimed,
        serde_json::json!({
            "task_id": task.task_id,
            "run_id": task.run_id,
            "taken_until": task.taken_until.to_rfc3339(),
        }),
    )
}

fn task_completed_event(task_id: &TaskId, run_id: RunId, status: StatusCode) -> JsonEvent {
    JsonEvent::new(
        JsonEventType::TaskCompleted,
        serde_json::json!({
            "task_id": task_id,
            "run_id": run_id,
            "status": status,
            "code": status.code(),
        }),
    )
}
