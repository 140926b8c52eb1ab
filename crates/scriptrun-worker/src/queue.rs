//! Queue client interface.
//!
//! The wire protocol lives outside this crate; the worker only needs the
//! three calls below. [`LocalQueue`] serves tasks handed to it directly,
//! which is what the `run` command uses.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use scriptrun_core::{ClaimedTask, RenewalResult, RunId, StatusCode, TaskId};

use crate::credentials::Credentials;

/// Queue call errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Worth retrying: network hiccup, throttling, 5xx.
    #[error("Transient queue error: {0}")]
    Transient(String),

    /// Retrying will not help: auth failure, unknown task, bad request.
    #[error("Queue error: {0}")]
    Fatal(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The calls the worker makes against the task queue.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Claim the next task for this worker, if there is one.
    async fn claim_task(&self) -> Result<Option<ClaimedTask>, QueueError>;

    /// Extend the claim on a running task.
    async fn reclaim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        credentials: &Credentials,
    ) -> Result<RenewalResult, QueueError>;

    /// Report the final status of a run. Called once per claimed task.
    async fn report_completed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        status: StatusCode,
    ) -> Result<(), QueueError>;
}

/// In-process queue fed with tasks up front.
///
/// Claims are renewed for `claim_duration` at a time until the run is
/// reported.
#[derive(Debug)]
pub struct LocalQueue {
    pending: Mutex<VecDeque<ClaimedTask>>,
    running: Mutex<HashMap<(TaskId, RunId), ClaimedTask>>,
    reports: Mutex<Vec<(TaskId, RunId, StatusCode)>>,
    claim_duration: chrono::Duration,
}

impl LocalQueue {
    pub fn new(tasks: impl IntoIterator<Item = ClaimedTask>) -> Self {
        Self {
            pending: Mutex::new(tasks.into_iter().collect()),
            running: Mutex::new(HashMap::new()),
            reports: Mutex::new(Vec::new()),
            claim_duration: chrono::Duration::minutes(20),
        }
    }

    /// Builder method to set how far each renewal extends the claim.
    pub fn with_claim_duration(mut self, duration: chrono::Duration) -> Self {
        self.claim_duration = duration;
        self
    }

    /// Statuses reported so far, in order.
    pub fn reports(&self) -> Vec<(TaskId, RunId, StatusCode)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueClient for LocalQueue {
    async fn claim_task(&self) -> Result<Option<ClaimedTask>, QueueError> {
        let Some(mut task) = self.pending.lock().unwrap().pop_front() else {
            return Ok(None);
        };
        task.taken_until = Utc::now() + self.claim_duration;
        info!(task_id = %task.task_id, run_id = %task.run_id, "Claimed task");
        self.running
            .lock()
            .unwrap()
            .insert((task.task_id.clone(), task.run_id), task.clone());
        Ok(Some(task))
    }

    async fn reclaim_task(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        _credentials: &Credentials,
    ) -> Result<RenewalResult, QueueError> {
        let mut running = self.running.lock().unwrap();
        let Some(task) = running.get_mut(&(task_id.clone(), run_id)) else {
            return Ok(RenewalResult::Lost);
        };
        task.taken_until = Utc::now() + self.claim_duration;
        debug!(task_id = %task_id, taken_until = %task.taken_until, "Renewed claim");
        Ok(RenewalResult::Renewed {
            taken_until: task.taken_until,
        })
    }

    async fn report_completed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        status: StatusCode,
    ) -> Result<(), QueueError> {
        if self
            .running
            .lock()
            .unwrap()
            .remove(&(task_id.clone(), run_id))
            .is_none()
        {
            return Err(QueueError::Fatal(format!(
                "run {run_id} of task {task_id} is not claimed"
            )));
        }
        info!(task_id = %task_id, run_id = %run_id, status = %status, "Reported task");
        self.reports
            .lock()
            .unwrap()
            .push((task_id.clone(), run_id, status));
        Ok(())
    }
}
