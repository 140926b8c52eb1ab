//! scriptrun worker
//!
//! Runs claimed queue tasks one at a time: the task command is executed as a
//! child process while the claim is renewed in the background, and the run
//! is settled into a single [`scriptrun_core::StatusCode`] that is reported
//! back to the queue.
//!
//! The queue and credential services are reached through the
//! [`queue::QueueClient`] and [`credentials::CredentialProvider`] traits.

pub mod artifacts;
pub mod config;
pub mod context;
pub mod credentials;
pub mod json_output;
pub mod process;
pub mod queue;
pub mod reclaim;
pub mod shutdown;
pub mod supervisor;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, WorkerConfig};
pub use context::Context;
pub use credentials::{
    CredentialProvider, CredentialSource, CredentialStore, Credentials, FileCredentials,
    StaticCredentials,
};
pub use json_output::JsonOutput;
pub use process::{LogPaths, ProcessRunner, RunnerError};
pub use queue::{LocalQueue, QueueClient, QueueError};
pub use reclaim::{ReclaimHandle, ReclaimLoop};
pub use supervisor::{SupervisorError, TaskExecutionSupervisor};
pub use worker::{serve, Worker, WorkerError};
