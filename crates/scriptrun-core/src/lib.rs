//! scriptrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - An async runtime
//! - Processes or the filesystem
//! - The queue's wire protocol
//!
//! Artifact trust rules and status resolution live here because both are
//! plain decisions over data.

pub mod artifact;
pub mod error;
pub mod ids;
pub mod outcome;
pub mod resolve;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use artifact::{
    is_trusted, ArtifactRule, ArtifactRuleConfig, ArtifactRules, TrustDecision, TrustedArtifact,
};
pub use error::CoreError;
pub use ids::{RunId, TaskId, WorkerId};
pub use outcome::{ExecutionOutcome, ReclaimOutcome, Termination};
pub use resolve::resolve;
pub use status::StatusCode;
pub use task::{ClaimedTask, RenewalResult};
