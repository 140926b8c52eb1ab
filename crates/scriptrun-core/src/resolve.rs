//! Status resolution.

use crate::{ExecutionOutcome, ReclaimOutcome, StatusCode};

/// Decide the status to report for a finished run.
///
/// Claim problems win over anything the process did: a run whose claim was
/// superseded is never reported as a success, even if the command exited 0.
pub fn resolve(outcome: &ExecutionOutcome, reclaim: &ReclaimOutcome) -> StatusCode {
    match reclaim {
        ReclaimOutcome::Superseded => return StatusCode::Superseded,
        ReclaimOutcome::ClaimLost { .. } | ReclaimOutcome::ShutdownRequested => {
            return StatusCode::WorkerShutdown
        }
        ReclaimOutcome::Held => {}
    }

    if outcome.timed_out() {
        return StatusCode::Failure;
    }
    if outcome.launch_failed() {
        return StatusCode::InternalError;
    }
    match outcome.exit_code() {
        Some(0) => StatusCode::Success,
        _ => StatusCode::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Termination;

    fn outcome(termination: Termination) -> ExecutionOutcome {
        ExecutionOutcome::new(termination, "stdout.log", "log.txt")
    }

    fn exited(code: i32) -> ExecutionOutcome {
        outcome(Termination::Exited { code: Some(code) })
    }

    #[test]
    fn test_exit_codes() {
        let held = ReclaimOutcome::Held;
        assert_eq!(resolve(&exited(0), &held), StatusCode::Success);
        assert_eq!(resolve(&exited(1), &held), StatusCode::Failure);
        assert_eq!(resolve(&exited(2), &held), StatusCode::Failure);
        let no_code = outcome(Termination::Exited { code: None });
        assert_eq!(resolve(&no_code, &held), StatusCode::Failure);
    }

    #[test]
    fn test_timeout_is_failure() {
        assert_eq!(
            resolve(&outcome(Termination::TimedOut), &ReclaimOutcome::Held),
            StatusCode::Failure
        );
    }

    #[test]
    fn test_launch_failure_is_internal_error() {
        let o = outcome(Termination::LaunchFailed {
            reason: "No such file or directory".into(),
        });
        assert_eq!(resolve(&o, &ReclaimOutcome::Held), StatusCode::InternalError);
    }

    #[test]
    fn test_cancelled_without_claim_problem_is_failure() {
        assert_eq!(
            resolve(&outcome(Termination::Cancelled), &ReclaimOutcome::Held),
            StatusCode::Failure
        );
    }

    #[test]
    fn test_superseded_overrides_success() {
        assert_eq!(
            resolve(&exited(0), &ReclaimOutcome::Superseded),
            StatusCode::Superseded
        );
        assert_eq!(
            resolve(&outcome(Termination::TimedOut), &ReclaimOutcome::Superseded),
            StatusCode::Superseded
        );
    }

    #[test]
    fn test_lost_claim_and_shutdown_report_worker_shutdown() {
        let lost = ReclaimOutcome::ClaimLost {
            reason: "claim expired".into(),
        };
        assert_eq!(resolve(&exited(0), &lost), StatusCode::WorkerShutdown);
        assert_eq!(
            resolve(&exited(1), &ReclaimOutcome::ShutdownRequested),
            StatusCode::WorkerShutdown
        );
        let launch = outcome(Termination::LaunchFailed { reason: "x".into() });
        assert_eq!(resolve(&launch, &lost), StatusCode::WorkerShutdown);
    }
}
