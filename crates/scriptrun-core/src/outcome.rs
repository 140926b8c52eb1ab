//! What happened during one task run.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// How the task process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Termination {
    /// The process exited on its own. `code` is absent when it died from a
    /// signal nobody on this side sent.
    Exited { code: Option<i32> },
    /// Killed after running past its deadline.
    TimedOut,
    /// Killed because the run was called off (lost claim, worker shutdown).
    Cancelled,
    /// The command never started.
    LaunchFailed { reason: String },
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Exited { code: None } => f.write_str("exited without a code"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::LaunchFailed { reason } => write!(f, "failed to launch: {reason}"),
        }
    }
}

/// Result of running a task command. Built once by the process runner and
/// read once when the status is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    termination: Termination,
    stdout_log: PathBuf,
    combined_log: PathBuf,
}

impl ExecutionOutcome {
    pub fn new(
        termination: Termination,
        stdout_log: impl Into<PathBuf>,
        combined_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            termination,
            stdout_log: stdout_log.into(),
            combined_log: combined_log.into(),
        }
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    /// Raw exit code, if the process exited and reported one.
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited { code } => code,
            _ => None,
        }
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.termination, Termination::TimedOut)
    }

    pub fn launch_failed(&self) -> bool {
        matches!(self.termination, Termination::LaunchFailed { .. })
    }

    /// Log holding stdout only.
    pub fn stdout_log(&self) -> &Path {
        &self.stdout_log
    }

    /// Log holding stdout, `ERROR `-prefixed stderr and the exit footer.
    pub fn combined_log(&self) -> &Path {
        &self.combined_log
    }
}

/// What the claim renewal loop saw by the time it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReclaimOutcome {
    /// The claim was still ours when renewal stopped.
    Held,
    /// The queue says another run superseded this one.
    Superseded,
    /// The claim is gone: expired, taken over, or renewal failed for good.
    ClaimLost { reason: String },
    /// The worker was asked to shut down mid-task.
    ShutdownRequested,
}

impl ReclaimOutcome {
    /// Whether the run should be called off.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(termination: Termination) -> ExecutionOutcome {
        ExecutionOutcome::new(termination, "/logs/stdout.log", "/logs/log.txt")
    }

    #[test]
    fn test_exit_code_only_for_exited() {
        let exited = outcome(Termination::Exited { code: Some(2) });
        assert_eq!(exited.exit_code(), Some(2));
        assert_eq!(outcome(Termination::TimedOut).exit_code(), None);
        assert_eq!(outcome(Termination::Cancelled).exit_code(), None);
        let launch = outcome(Termination::LaunchFailed {
            reason: "nope".into(),
        });
        assert_eq!(launch.exit_code(), None);
    }

    #[test]
    fn test_flags() {
        assert!(outcome(Termination::TimedOut).timed_out());
        assert!(!outcome(Termination::Exited { code: Some(0) }).timed_out());
        let launch = outcome(Termination::LaunchFailed { reason: "x".into() });
        assert!(launch.launch_failed());
    }

    #[test]
    fn test_log_paths() {
        let o = outcome(Termination::Exited { code: Some(0) });
        assert_eq!(o.stdout_log(), Path::new("/logs/stdout.log"));
        assert_eq!(o.combined_log(), Path::new("/logs/log.txt"));
    }

    #[test]
    fn test_termination_display() {
        let exited = Termination::Exited { code: Some(1) };
        assert_eq!(exited.to_string(), "exited with code 1");
        assert_eq!(Termination::TimedOut.to_string(), "timed out");
    }
}
