//! One task, start to finish.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use scriptrun_core::{resolve, ReclaimOutcome, StatusCode, Termination};

use crate::context::Context;
use crate::process::{ProcessRunner, RunnerError};
use crate::queue::QueueError;
use crate::reclaim::ReclaimLoop;

/// Slack on top of the renewal call timeout when joining the reclaim loop.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Errors that prevent a run from producing a status of its own.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to prepare '{path}': {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Failed to report task status: {0}")]
    Report(#[from] QueueError),
}

/// Runs a claimed task: renews its claim while its command runs, then
/// settles on a status.
#[derive(Debug, Clone)]
pub struct TaskExecutionSupervisor {
    stop_grace: Duration,
}

impl Default for TaskExecutionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutionSupervisor {
    pub fn new() -> Self {
        Self {
            stop_grace: STOP_GRACE,
        }
    }

    /// Run the task in `ctx` and resolve its status.
    ///
    /// The reclaim loop is always stopped and joined before this returns,
    /// including when the runner fails. A lost or superseded claim, and a
    /// worker shutdown, end the process early.
    pub async fn run(&self, ctx: &Context) -> Result<StatusCode, SupervisorError> {
        for dir in [
            &ctx.config.log_dir,
            &ctx.config.work_dir,
            &ctx.config.artifact_dir,
        ] {
            ensure_dir(dir).await?;
        }

        info!(task_id = %ctx.task_id(), run_id = %ctx.run_id(), "Running task");

        let run_cancel = ctx.shutdown.child_token();
        let reclaim = ReclaimLoop::from_context(ctx).start(run_cancel.clone());

        let runner = ProcessRunner::from_config(&ctx.config);
        let executed = runner.execute(&ctx.log_paths(), &run_cancel).await;

        let mut reclaim_outcome = reclaim
            .stop(ctx.config.reclaim_timeout + self.stop_grace)
            .await;
        let outcome = executed?;

        // Only a run that shutdown actually cut short counts as shut down; a
        // process that exited on its own keeps its result.
        if !reclaim_outcome.is_terminal()
            && outcome.termination() == &Termination::Cancelled
            && ctx.shutdown.is_cancelled()
        {
            reclaim_outcome = ReclaimOutcome::ShutdownRequested;
        }

        let status = resolve(&outcome, &reclaim_outcome);
        info!(
            task_id = %ctx.task_id(),
            run_id = %ctx.run_id(),
            termination = %outcome.termination(),
            reclaim = ?reclaim_outcome,
            status = %status,
            "Task resolved"
        );
        Ok(status)
    }

    /// Run the task and report its status to the queue exactly once.
    ///
    /// A run that fails outright is reported as `internal-error`. Only a
    /// failure to report is returned as an error.
    pub async fn run_and_report(&self, ctx: &Context) -> Result<StatusCode, SupervisorError> {
        let status = match self.run(ctx).await {
            Ok(status) => status,
            Err(e) => {
                error!(task_id = %ctx.task_id(), error = %e, "Task run failed");
                ctx.events.error(&e.to_string());
                StatusCode::InternalError
            }
        };

        if let Err(e) = ctx
            .queue
            .report_completed(ctx.task_id(), ctx.run_id(), status)
            .await
        {
            warn!(
                task_id = %ctx.task_id(),
                status = %status,
                error = %e,
                "Failed to report task"
            );
            ctx.events.error(&e.to_string());
            return Err(e.into());
        }

        ctx.events.task_completed(ctx.task_id(), ctx.run_id(), status);
        Ok(status)
    }
}

async fn ensure_dir(path: &Path) -> Result<(), SupervisorError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| SupervisorError::Prepare {
            path: path.to_path_buf(),
            source,
        })
}
