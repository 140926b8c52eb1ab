//! Claimed task and lease renewal types.

use crate::{RunId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A task this worker holds a claim on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedTask {
    /// Queue task identifier.
    pub task_id: TaskId,

    /// Which run of the task this claim covers.
    #[serde(default)]
    pub run_id: RunId,

    /// When the current claim expires unless renewed.
    #[serde(default = "Utc::now")]
    pub taken_until: DateTime<Utc>,

    /// Task payload, passed through untouched.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Task labels/metadata.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl ClaimedTask {
    /// Create a claim on `task_id` held until `taken_until`.
    pub fn new(task_id: impl Into<TaskId>, run_id: RunId, taken_until: DateTime<Utc>) -> Self {
        Self {
            task_id: task_id.into(),
            run_id,
            taken_until,
            payload: serde_json::Value::Null,
            labels: HashMap::new(),
        }
    }

    /// Builder method to set the payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether the claim has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.taken_until
    }
}

/// Queue response to a claim renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum RenewalResult {
    /// Claim extended.
    Renewed { taken_until: DateTime<Utc> },
    /// The claim expired or was handed to someone else.
    Lost,
    /// The run was superseded or cancelled upstream.
    Superseded,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_claim_expiry() {
        let now = Utc::now();
        let task = ClaimedTask::new("T1", RunId::new(0), now + Duration::seconds(30));
        assert!(!task.is_expired(now));
        assert!(task.is_expired(now + Duration::seconds(30)));
    }

    #[test]
    fn test_claim_deserializes_with_defaults() {
        let task: ClaimedTask = serde_json::from_str(
            r#"{"task_id": "abc", "taken_until": "2016-04-16T03:46:24.958Z"}"#,
        )
        .unwrap();
        assert_eq!(task.task_id.as_str(), "abc");
        assert_eq!(task.run_id, RunId::new(0));
        assert!(task.payload.is_null());
        assert!(task.labels.is_empty());
    }

    #[test]
    fn test_builders() {
        let task = ClaimedTask::new("T1", RunId::new(1), Utc::now())
            .with_payload(serde_json::json!({"upstreamArtifacts": []}))
            .with_label("kind", "signing");
        assert_eq!(task.labels.get("kind").map(String::as_str), Some("signing"));
        assert!(task.payload.get("upstreamArtifacts").is_some());
    }
}
