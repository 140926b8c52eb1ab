//! Core domain errors.

use thiserror::Error;

/// Core domain errors for scriptrun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A status name or code outside the closed set.
    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    /// An artifact rule failed validation when it was loaded.
    #[error("Invalid artifact rule #{index}: {reason}")]
    InvalidRule { index: usize, reason: String },

    /// A URL matched no configured artifact rule.
    #[error("Untrusted artifact url: {0}")]
    UntrustedUrl(String),

    /// A validated artifact path would escape its destination directory.
    #[error("Unsafe artifact path: {0}")]
    UnsafePath(String),
}
