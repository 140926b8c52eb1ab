//! Task command execution.
//!
//! Runs the task command as a child process, tees its output into two log
//! files and enforces a hard deadline. Both output streams are read
//! concurrently and funnelled through one writer, so the combined log keeps
//! the order lines arrived in (as far as the pipes preserve it).

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scriptrun_core::{ExecutionOutcome, Termination};

use crate::config::WorkerConfig;

/// File name of the combined log inside the log directory.
pub const COMBINED_LOG_NAME: &str = "log.txt";
/// File name of the stdout-only log inside the log directory.
pub const STDOUT_LOG_NAME: &str = "stdout.log";

/// Prefix marking stderr lines in the combined log.
const STDERR_PREFIX: &str = "ERROR ";

/// How long to wait for the output pipes to drain once the process is gone.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that stop a run from being supervised at all. A command that
/// cannot be started is not one of them; see [`Termination::LaunchFailed`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Task command is empty")]
    EmptyCommand,

    #[error("Failed to open log '{path}': {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write task logs: {0}")]
    LogWrite(#[from] io::Error),

    #[error("Failed to wait for task process: {0}")]
    Wait(#[source] io::Error),
}

/// The two log files of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    /// Stdout lines only.
    pub stdout: PathBuf,
    /// Stdout, `ERROR `-prefixed stderr, and the exit footer.
    pub combined: PathBuf,
}

impl LogPaths {
    /// The standard log file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            stdout: dir.join(STDOUT_LOG_NAME),
            combined: dir.join(COMBINED_LOG_NAME),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputLine {
    stream: Stream,
    text: String,
}

/// Runs one task command.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// Program followed by its arguments.
    command: Vec<String>,

    /// Working directory of the child.
    work_dir: PathBuf,

    /// Wall-clock limit.
    deadline: Duration,
}

impl ProcessRunner {
    /// Create a runner for `command` in the current directory with the
    /// default task deadline.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            work_dir: PathBuf::from("."),
            deadline: WorkerConfig::default().task_max_timeout,
        }
    }

    /// Runner for the configured task script.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.task_script.clone())
            .with_work_dir(&config.work_dir)
            .with_deadline(config.task_max_timeout)
    }

    /// Set the working directory.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Set the wall-clock limit.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Run the command to completion, deadline, or cancellation.
    ///
    /// Both log files are created (or truncated) first. The combined log
    /// always ends with an `exit code: <N|None>` line written after the
    /// output pipes have been drained.
    pub async fn execute(
        &self,
        logs: &LogPaths,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, RunnerError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(RunnerError::EmptyCommand)?;
        let mut writer = LogWriter::create(logs).await?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down everything the
        // task started.
        #[cfg(unix)]
        cmd.process_group(0);

        info!(
            program = %program,
            work_dir = %self.work_dir.display(),
            deadline_secs = self.deadline.as_secs_f64(),
            "Starting task process"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program = %program, error = %e, "Failed to launch task process");
                let reason = e.to_string();
                writer
                    .write_line(&OutputLine {
                        stream: Stream::Stderr,
                        text: format!("failed to launch {program}: {reason}"),
                    })
                    .await?;
                writer.finish(None).await?;
                return Ok(self.outcome(Termination::LaunchFailed { reason }, logs));
            }
        };
        let pid = child.id();
        debug!(pid = ?pid, "Task process spawned");

        let (tx, mut rx) = mpsc::channel::<OutputLine>(256);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(stdout, Stream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, Stream::Stderr, tx.clone())));
        }
        // The channel closes once both readers are done.
        drop(tx);

        let write_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                writer.write_line(&line).await?;
            }
            Ok::<_, io::Error>(writer)
        });

        let termination = match self.wait(&mut child, cancel).await {
            Ok(termination) => termination,
            Err(e) => {
                kill_process_tree(&mut child, pid).await;
                return Err(RunnerError::Wait(e));
            }
        };

        // Anything the task left running in its group goes too. The leader
        // is already reaped; its id stays reserved as a group id only while a
        // member is alive, so an empty group answers ESRCH. A new group reusing
        // the id in between is possible but needs the pid to wrap around first.
        #[cfg(unix)]
        if let Some(pid) = pid {
            match signal_group(pid, libc::SIGKILL) {
                Ok(()) => debug!(pid, "Killed processes left behind by the task"),
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
                Err(e) => debug!(pid, error = %e, "Failed to signal process group"),
            }
        }

        let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
        let drain = async {
            for reader in readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(IO_CAPTURE_TIMEOUT, drain)
            .await
            .is_err()
        {
            warn!("Task output did not drain in time; dropping the rest");
            for abort in aborts {
                abort.abort();
            }
        }

        let writer = write_task
            .await
            .map_err(|e| RunnerError::LogWrite(io::Error::other(e)))??;

        let outcome = self.outcome(termination, logs);
        writer.finish(outcome.exit_code()).await?;

        info!(termination = %outcome.termination(), "Task process finished");
        Ok(outcome)
    }

    async fn wait(&self, child: &mut Child, cancel: &CancellationToken) -> io::Result<Termination> {
        enum Waited {
            Exited(io::Result<std::process::ExitStatus>),
            Deadline,
            Cancelled,
        }

        let pid = child.id();
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(self.deadline) => Waited::Deadline,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        match waited {
            Waited::Exited(status) => Ok(Termination::Exited {
                code: status?.code(),
            }),
            Waited::Deadline => {
                warn!(
                    pid = ?pid,
                    deadline_secs = self.deadline.as_secs_f64(),
                    "Task process timed out; killing"
                );
                kill_process_tree(child, pid).await;
                Ok(Termination::TimedOut)
            }
            Waited::Cancelled => {
                info!(pid = ?pid, "Task run cancelled; killing process");
                kill_process_tree(child, pid).await;
                Ok(Termination::Cancelled)
            }
        }
    }

    fn outcome(&self, termination: Termination, logs: &LogPaths) -> ExecutionOutcome {
        ExecutionOutcome::new(termination, logs.stdout.clone(), logs.combined.clone())
    }
}

/// Read `reader` line by line into `tx` until EOF.
async fn pump<R>(reader: R, stream: Stream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(|c| c == '\n' || c == '\r')
                    .to_string();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(stream = ?stream, error = %e, "Error reading task output");
                break;
            }
        }
    }
}

/// Kill the child and, on Unix, its whole process group, then reap it.
async fn kill_process_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        if let Err(e) = signal_group(pid, libc::SIGKILL) {
            debug!(pid, error = %e, "Failed to signal process group");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill task process");
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions; it only sends a
    // signal to the group this runner created.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Owner of both log files for the length of a run.
struct LogWriter {
    stdout: BufWriter<File>,
    combined: BufWriter<File>,
}

impl LogWriter {
    async fn create(paths: &LogPaths) -> Result<Self, RunnerError> {
        Ok(Self {
            stdout: BufWriter::new(create_log(&paths.stdout).await?),
            combined: BufWriter::new(create_log(&paths.combined).await?),
        })
    }

    async fn write_line(&mut self, line: &OutputLine) -> io::Result<()> {
        match line.stream {
            Stream::Stdout => {
                self.stdout.write_all(line.text.as_bytes()).await?;
                self.stdout.write_all(b"\n").await?;
                self.combined.write_all(line.text.as_bytes()).await?;
            }
            Stream::Stderr => {
                self.combined.write_all(STDERR_PREFIX.as_bytes()).await?;
                self.combined.write_all(line.text.as_bytes()).await?;
            }
        }
        self.combined.write_all(b"\n").await
    }

    async fn finish(mut self, exit_code: Option<i32>) -> io::Result<()> {
        self.combined
            .write_all(exit_footer(exit_code).as_bytes())
            .await?;
        self.stdout.flush().await?;
        self.combined.flush().await
    }
}

async fn create_log(path: &Path) -> Result<File, RunnerError> {
    File::create(path)
        .await
        .map_err(|source| RunnerError::LogFile {
            path: path.to_path_buf(),
            source,
        })
}

fn exit_footer(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code: {code}\n"),
        None => "exit code: None\n".to_string(),
    }
}
