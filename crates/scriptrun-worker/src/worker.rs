//! The claim/run/report loop.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scriptrun_core::StatusCode;

use crate::config::WorkerConfig;
use crate::context::Context;
use crate::credentials::{
    spawn_credential_refresh, CredentialProvider, CredentialSource, CredentialStore,
};
use crate::json_output::JsonOutput;
use crate::queue::{QueueClient, QueueError};
use crate::supervisor::{SupervisorError, TaskExecutionSupervisor};
use crate::utils;

/// Worker loop errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to claim task: {0}")]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl WorkerError {
    /// Whether the loop should keep polling after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_transient(),
            // The claim will expire on its own; the next task may fare better.
            Self::Supervisor(SupervisorError::Report(_)) => true,
            Self::Supervisor(_) => false,
        }
    }
}

/// Claims tasks one at a time and runs each to a reported status.
pub struct Worker {
    config: Arc<WorkerConfig>,
    queue: Arc<dyn QueueClient>,
    credentials: Arc<dyn CredentialProvider>,
    events: JsonOutput,
    shutdown: CancellationToken,
    supervisor: TaskExecutionSupervisor,
}

impl Worker {
    pub fn new(
        config: Arc<WorkerConfig>,
        queue: Arc<dyn QueueClient>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            config,
            queue,
            credentials,
            events: JsonOutput::default(),
            shutdown: CancellationToken::new(),
            supervisor: TaskExecutionSupervisor::new(),
        }
    }

    /// Builder method to set the event output.
    pub fn with_events(mut self, events: JsonOutput) -> Self {
        self.events = events;
        self
    }

    /// Builder method to set the shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Claim and run one task. `Ok(None)` when the queue had nothing.
    pub async fn run_once(&self) -> Result<Option<StatusCode>, WorkerError> {
        let Some(task) = self.queue.claim_task().await? else {
            debug!("No task available");
            return Ok(None);
        };

        info!(task_id = %task.task_id, run_id = %task.run_id, "Claimed task");
        self.events.task_claimed(&task);
        if task.is_expired(Utc::now()) {
            warn!(
                task_id = %task.task_id,
                taken_until = %task.taken_until,
                "Claim already expired; running anyway"
            );
        }

        // The supervisor reports a failure here as internal-error.
        if let Err(e) = utils::prepare_dirs(&self.config).await {
            warn!(error = %e, "Failed to prepare task directories");
        }

        let ctx = Context::new(
            self.config.clone(),
            task,
            self.queue.clone(),
            self.credentials.clone(),
        )
        .with_events(self.events)
        .with_shutdown(self.shutdown.clone());

        let result = self.supervisor.run_and_report(&ctx).await;

        if let Err(e) = utils::cleanup(&self.config).await {
            warn!(error = %e, "Failed to clean up after task");
        }

        Ok(Some(result?))
    }

    /// Run tasks until the shutdown token fires or an unrecoverable error
    /// occurs. Sleeps `poll_interval` whenever the queue is empty.
    pub async fn run_until_shutdown(&self) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.config.worker_id,
            worker_type = %self.config.worker_type,
            "Worker started"
        );

        while !self.shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(status)) => {
                    debug!(status = %status, "Task finished");
                    continue;
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Worker loop error; retrying");
                    self.events.error(&e.to_string());
                }
                Err(e) => {
                    error!(error = %e, "Worker loop stopped");
                    self.events.error(&e.to_string());
                    return Err(e);
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Worker shut down");
        Ok(())
    }
}

/// Run tasks until `shutdown` with credentials taken from `source`, which
/// is re-read every `credential_update_interval`. The configured
/// credentials are used until the first successful read.
pub async fn serve(
    config: Arc<WorkerConfig>,
    queue: Arc<dyn QueueClient>,
    source: Arc<dyn CredentialSource>,
    events: JsonOutput,
    shutdown: CancellationToken,
) -> Result<(), WorkerError> {
    let initial = match source.fetch().await {
        Ok(credentials) => credentials,
        Err(e) => {
            warn!(error = %e, "Using configured credentials");
            config.credentials.clone()
        }
    };
    let store = Arc::new(CredentialStore::new(initial));

    let refresh_stop = shutdown.child_token();
    let refresh = spawn_credential_refresh(
        source,
        store.clone(),
        config.credential_update_interval,
        refresh_stop.clone(),
    );

    let worker = Worker::new(config, queue, store)
        .with_events(events)
        .with_shutdown(shutdown);
    let result = worker.run_until_shutdown().await;

    refresh_stop.cancel();
    if let Err(e) = refresh.await {
        warn!(error = %e, "Credential refresh task failed");
    }
    result
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use scriptrun_core::{ClaimedTask, RenewalResult, RunId, TaskId};

    use crate::credentials::{Credentials, FileCredentials, StaticCredentials};
    use crate::testing::{sh_config, ScriptedQueue};

    fn task(id: &str) -> ClaimedTask {
        ClaimedTask::new(id, RunId::new(0), Utc::now() + chrono::Duration::minutes(20))
    }

    fn worker(config: WorkerConfig, queue: Arc<dyn QueueClient>) -> Worker {
        Worker::new(
            Arc::new(config),
            queue,
            Arc::new(StaticCredentials::new(Credentials::new("client", "token"))),
        )
    }

    struct BrokenQueue(fn() -> QueueError);

    #[async_trait]
    impl QueueClient for BrokenQueue {
        async fn claim_task(&self) -> Result<Option<ClaimedTask>, QueueError> {
            Err((self.0)())
        }

        async fn reclaim_task(
            &self,
            _task_id: &TaskId,
            _run_id: RunId,
            _credentials: &Credentials,
        ) -> Result<RenewalResult, QueueError> {
            Ok(RenewalResult::Lost)
        }

        async fn report_completed(
            &self,
            _task_id: &TaskId,
            _run_id: RunId,
            _status: StatusCode,
        ) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_once_runs_reports_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(ScriptedQueue::new().with_tasks([task("T1")]));
        let config = sh_config(dir.path(), "echo left > leftover.txt; echo done");
        let work_dir = config.work_dir.clone();
        let log_dir = config.log_dir.clone();
        let worker = worker(config, queue.clone());

        assert_eq!(worker.run_once().await.unwrap(), Some(StatusCode::Success));
        assert_eq!(
            queue.reports(),
            vec![(TaskId::new("T1"), RunId::new(0), StatusCode::Success)]
        );
        assert!(work_dir.is_dir());
        assert!(!work_dir.join("leftover.txt").exists());
        assert!(log_dir.join("log.txt").exists());

        assert_eq!(worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_report_failure_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(ScriptedQueue::new().with_tasks([task("T1")]));
        queue.fail_next_report(QueueError::Transient("503".to_string()));
        let worker = worker(sh_config(dir.path(), "true"), queue.clone());

        let err = worker.run_once().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(ScriptedQueue::new().with_tasks([task("T1"), task("T2")]));
        let mut config = sh_config(dir.path(), "exit 1");
        config.poll_interval = Duration::from_millis(20);
        let shutdown = CancellationToken::new();
        let worker = worker(config, queue.clone()).with_shutdown(shutdown.clone());

        let trigger = shutdown.clone();
        let reports = queue.clone();
        tokio::spawn(async move {
            while reports.reports().len() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            trigger.cancel();
        });

        tokio::time::timeout(Duration::from_secs(30), worker.run_until_shutdown())
            .await
            .unwrap()
            .unwrap();

        let statuses: Vec<_> = queue.reports().into_iter().map(|r| r.2).collect();
        assert_eq!(statuses, vec![StatusCode::Failure, StatusCode::Failure]);
    }

    #[tokio::test]
    async fn test_serve_renews_with_refreshed_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let creds_path = dir.path().join("credentials.json");
        std::fs::write(&creds_path, r#"{"clientId": "first", "accessToken": "t"}"#).unwrap();

        let queue = Arc::new(ScriptedQueue::new().with_tasks([task("T1")]));
        let mut config = sh_config(dir.path(), "sleep 1");
        config.reclaim_interval = Duration::from_millis(100);
        config.credential_update_interval = Duration::from_millis(50);
        config.poll_interval = Duration::from_millis(20);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let reports = queue.clone();
        let rotate = creds_path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            std::fs::write(&rotate, r#"{"clientId": "second", "accessToken": "t"}"#).unwrap();
            while reports.reports().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            trigger.cancel();
        });

        let served = serve(
            Arc::new(config),
            queue.clone(),
            Arc::new(FileCredentials::new(&creds_path)),
            JsonOutput::default(),
            shutdown,
        );
        tokio::time::timeout(Duration::from_secs(30), served)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(queue.reports()[0].2, StatusCode::Success);
        let seen = queue.renewal_clients();
        assert_eq!(seen.first().map(String::as_str), Some("first"));
        assert_eq!(seen.last().map(String::as_str), Some("second"));
    }

    #[tokio::test]
    async fn test_transient_claim_errors_keep_polling() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sh_config(dir.path(), "true");
        config.poll_interval = Duration::from_millis(10);
        let shutdown = CancellationToken::new();
        let worker = worker(
            config,
            Arc::new(BrokenQueue(|| QueueError::Transient("throttled".to_string()))),
        )
        .with_shutdown(shutdown.clone());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        worker.run_until_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_claim_error_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker(
            sh_config(dir.path(), "true"),
            Arc::new(BrokenQueue(|| QueueError::Fatal("unauthorized".to_string()))),
        );
        let err = worker.run_until_shutdown().await.unwrap_err();
        assert!(matches!(err, WorkerError::Queue(QueueError::Fatal(_))));
        assert!(!err.is_retryable());
    }
}
