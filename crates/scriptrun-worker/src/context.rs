//! Everything one task run needs, bundled.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use scriptrun_core::{ClaimedTask, RunId, TaskId};

use crate::config::WorkerConfig;
use crate::credentials::CredentialProvider;
use crate::json_output::JsonOutput;
use crate::process::LogPaths;
use crate::queue::QueueClient;

/// Per-task context. Created when a task is claimed, dropped once its
/// status has been reported.
#[derive(Clone)]
pub struct Context {
    /// Shared, read-only worker configuration.
    pub config: Arc<WorkerConfig>,

    /// The claimed task.
    pub task: ClaimedTask,

    /// Queue client used for renewal and reporting.
    pub queue: Arc<dyn QueueClient>,

    /// Current queue credentials.
    pub credentials: Arc<dyn CredentialProvider>,

    /// Lifecycle event output.
    pub events: JsonOutput,

    /// Fires when the whole worker is shutting down.
    pub shutdown: CancellationToken,
}

impl Context {
    pub fn new(
        config: Arc<WorkerConfig>,
        task: ClaimedTask,
        queue: Arc<dyn QueueClient>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            config,
            task,
            queue,
            credentials,
            events: JsonOutput::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Builder method to set the event output.
    pub fn with_events(mut self, events: JsonOutput) -> Self {
        self.events = events;
        self
    }

    /// Builder method to tie this task to the worker's shutdown token.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task.task_id
    }

    pub fn run_id(&self) -> RunId {
        self.task.run_id
    }

    /// Where this run's logs go.
    pub fn log_paths(&self) -> LogPaths {
        LogPaths::in_dir(&self.config.log_dir)
    }
}
