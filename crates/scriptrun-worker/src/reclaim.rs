//! Claim renewal for a running task.
//!
//! The loop lives exactly as long as the task's process. It is started
//! right before the process is launched and stopped, and joined, before the
//! task's status is reported, so no renewal can race the report.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scriptrun_core::{ReclaimOutcome, RenewalResult, RunId, TaskId};

use crate::context::Context;
use crate::credentials::CredentialProvider;
use crate::json_output::JsonOutput;
use crate::queue::QueueClient;

/// Periodic claim renewal for one task.
pub struct ReclaimLoop {
    queue: Arc<dyn QueueClient>,
    credentials: Arc<dyn CredentialProvider>,
    task_id: TaskId,
    run_id: RunId,
    interval: Duration,
    call_timeout: Duration,
    events: JsonOutput,
}

impl ReclaimLoop {
    pub fn new(
        queue: Arc<dyn QueueClient>,
        credentials: Arc<dyn CredentialProvider>,
        task_id: TaskId,
        run_id: RunId,
        interval: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            credentials,
            task_id,
            run_id,
            interval,
            call_timeout,
            events: JsonOutput::default(),
        }
    }

    /// Loop for the task in `ctx`, using its configured interval and timeout.
    pub fn from_context(ctx: &Context) -> Self {
        Self::new(
            ctx.queue.clone(),
            ctx.credentials.clone(),
            ctx.task_id().clone(),
            ctx.run_id(),
            ctx.config.reclaim_interval,
            ctx.config.reclaim_timeout,
        )
        .with_events(ctx.events)
    }

    /// Builder method to set the event output.
    pub fn with_events(mut self, events: JsonOutput) -> Self {
        self.events = events;
        self
    }

    /// Start renewing in the background.
    ///
    /// `abort_run` is cancelled if the claim is lost or superseded, so the
    /// caller can stop work that no longer belongs to this worker.
    pub fn start(self, abort_run: CancellationToken) -> ReclaimHandle {
        let stop = CancellationToken::new();
        let join = tokio::spawn(self.run(stop.clone(), abort_run));
        ReclaimHandle { stop, join }
    }

    async fn run(self, stop: CancellationToken, abort_run: CancellationToken) -> ReclaimOutcome {
        info!(
            task_id = %self.task_id,
            run_id = %self.run_id,
            interval_secs = self.interval.as_secs_f64(),
            "Reclaim loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            // Both branches may have been ready at once.
            if stop.is_cancelled() {
                break;
            }

            if let Some(outcome) = self.renew_once().await {
                abort_run.cancel();
                info!(
                    task_id = %self.task_id,
                    run_id = %self.run_id,
                    outcome = ?outcome,
                    "Reclaim loop stopped"
                );
                return outcome;
            }
        }

        debug!(task_id = %self.task_id, run_id = %self.run_id, "Reclaim loop stopped on request");
        ReclaimOutcome::Held
    }

    /// One renewal call. `Some` ends the loop.
    async fn renew_once(&self) -> Option<ReclaimOutcome> {
        let credentials = self.credentials.current();
        let call = self.queue.reclaim_task(&self.task_id, self.run_id, &credentials);

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(RenewalResult::Renewed { taken_until })) => {
                debug!(task_id = %self.task_id, taken_until = %taken_until, "Claim renewed");
                self.events.task_reclaimed(&self.task_id, self.run_id, taken_until);
                None
            }
            Ok(Ok(RenewalResult::Superseded)) => {
                warn!(task_id = %self.task_id, run_id = %self.run_id, "Task superseded");
                Some(ReclaimOutcome::Superseded)
            }
            Ok(Ok(RenewalResult::Lost)) => {
                warn!(task_id = %self.task_id, run_id = %self.run_id, "Claim lost");
                Some(ReclaimOutcome::ClaimLost {
                    reason: "queue no longer holds the claim".to_string(),
                })
            }
            Ok(Err(e)) if e.is_transient() => {
                warn!(
                    task_id = %self.task_id,
                    error = %e,
                    "Renewal failed; retrying next interval"
                );
                None
            }
            Ok(Err(e)) => {
                error!(task_id = %self.task_id, error = %e, "Renewal failed");
                Some(ReclaimOutcome::ClaimLost {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    task_id = %self.task_id,
                    timeout_secs = self.call_timeout.as_secs_f64(),
                    "Renewal call timed out; retrying next interval"
                );
                None
            }
        }
    }
}

/// Handle to a started [`ReclaimLoop`].
pub struct ReclaimHandle {
    stop: CancellationToken,
    join: JoinHandle<ReclaimOutcome>,
}

impl ReclaimHandle {
    /// Ask the loop to stop without waiting. Safe to call repeatedly.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Whether the loop has already ended on its own or after a stop.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and wait for it, including any renewal call in
    /// flight, for at most `deadline`. Past the deadline the loop is
    /// aborted and the claim is treated as still held.
    pub async fn stop(mut self, deadline: Duration) -> ReclaimOutcome {
        self.request_stop();
        match tokio::time::timeout(deadline, &mut self.join).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(error = %e, "Reclaim loop panicked");
                ReclaimOutcome::Held
            }
            Err(_) => {
                warn!(
                    deadline_secs = deadline.as_secs_f64(),
                    "Reclaim loop did not stop in time; aborting"
                );
                self.join.abort();
                ReclaimOutcome::Held
            }
        }
    }
}
