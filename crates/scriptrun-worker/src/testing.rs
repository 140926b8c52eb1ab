//! Test doubles shared by the worker's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use scriptrun_core::{ClaimedTask, RenewalResult, RunId, StatusCode, TaskId};

use crate::config::WorkerConfig;
use crate::context::Context;
use crate::credentials::{Credentials, StaticCredentials};
use crate::queue::{QueueClient, QueueError};

/// Queue whose renewal answers are scripted up front. Once the script runs
/// out every renewal succeeds.
#[derive(Default)]
pub struct ScriptedQueue {
    tasks: Mutex<VecDeque<ClaimedTask>>,
    renewals: Mutex<VecDeque<Result<RenewalResult, QueueError>>>,
    call_delay: Duration,
    started: AtomicUsize,
    completed: AtomicUsize,
    reports: Mutex<Vec<(TaskId, RunId, StatusCode)>>,
    calls_at_report: Mutex<Vec<(usize, usize)>>,
    renewal_clients: Mutex<Vec<String>>,
    report_error: Mutex<Option<QueueError>>,
}

impl ScriptedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(self, tasks: impl IntoIterator<Item = ClaimedTask>) -> Self {
        *self.tasks.lock().unwrap() = tasks.into_iter().collect();
        self
    }

    pub fn with_renewals(
        self,
        renewals: impl IntoIterator<Item = Result<RenewalResult, QueueError>>,
    ) -> Self {
        *self.renewals.lock().unwrap() = renewals.into_iter().collect();
        self
    }

    /// Every renewal call takes this long.
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// The next report fails with `error`.
    pub fn fail_next_report(&self, error: QueueError) {
        *self.report_error.lock().unwrap() = Some(error);
    }

    pub fn calls_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn calls_completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<(TaskId, RunId, StatusCode)> {
        self.reports.lock().unwrap().clone()
    }

    /// Client id sent with each renewal call, in call order.
    pub fn renewal_clients(&self) -> Vec<String> {
        self.renewal_clients.lock().unwrap().clone()
    }

    /// Renewal calls (started, completed) as seen by each report.
    pub fn calls_at_report(&self) -> Vec<(usize, usize)> {
        self.calls_at_report.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueClient for ScriptedQueue {
    async fn claim_task(&self) -> Result<Option<ClaimedTask>, QueueError> {
        Ok(self.tasks.lock().unwrap().pop_front())
    }

    async fn reclaim_task(
        &self,
        _task_id: &TaskId,
        _run_id: RunId,
        credentials: &Credentials,
    ) -> Result<RenewalResult, QueueError> {
        self.renewal_clients
            .lock()
            .unwrap()
            .push(credentials.client_id.clone());
        self.started.fetch_add(1, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
        let answer = self.renewals.lock().unwrap().pop_front();
        self.completed.fetch_add(1, Ordering::SeqCst);
        answer.unwrap_or_else(|| {
            Ok(RenewalResult::Renewed {
                taken_until: Utc::now() + chrono::Duration::minutes(20),
            })
        })
    }

    async fn report_completed(
        &self,
        task_id: &TaskId,
        run_id: RunId,
        status: StatusCode,
    ) -> Result<(), QueueError> {
        self.calls_at_report
            .lock()
            .unwrap()
            .push((self.calls_started(), self.calls_completed()));
        if let Some(error) = self.report_error.lock().unwrap().take() {
            return Err(error);
        }
        self.reports
            .lock()
            .unwrap()
            .push((task_id.clone(), run_id, status));
        Ok(())
    }
}

/// A config rooted in `root` running `sh -c script`.
pub fn sh_config(root: &std::path::Path, script: &str) -> WorkerConfig {
    WorkerConfig {
        work_dir: root.join("work"),
        log_dir: root.join("logs"),
        artifact_dir: root.join("artifacts"),
        task_script: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        ..WorkerConfig::default()
    }
}

/// Context for task `T1` run 0 against `queue`.
pub fn context(config: WorkerConfig, queue: Arc<ScriptedQueue>) -> Context {
    let task = ClaimedTask::new("T1", RunId::new(0), Utc::now() + chrono::Duration::minutes(20));
    Context::new(
        Arc::new(config),
        task,
        queue,
        Arc::new(StaticCredentials::new(Credentials::new("client", "token"))),
    )
    .with_shutdown(CancellationToken::new())
}
