//! Report codes sent upstream when a task run finishes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Final disposition of a task run, as reported to the queue.
///
/// The name and numeric code of every variant live in the two `match`
/// tables below; the compiler rejects a new variant until both are filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    Success,
    Failure,
    WorkerShutdown,
    MalformedPayload,
    ResourceUnavailable,
    InternalError,
    Superseded,
}

impl StatusCode {
    /// Every status, in code order.
    pub const ALL: [StatusCode; 7] = [
        StatusCode::Success,
        StatusCode::Failure,
        StatusCode::WorkerShutdown,
        StatusCode::MalformedPayload,
        StatusCode::ResourceUnavailable,
        StatusCode::InternalError,
        StatusCode::Superseded,
    ];

    /// Numeric code used on the wire and as the worker's exit status.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::WorkerShutdown => 2,
            Self::MalformedPayload => 3,
            Self::ResourceUnavailable => 4,
            Self::InternalError => 5,
            Self::Superseded => 6,
        }
    }

    /// Symbolic name understood by the queue.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::WorkerShutdown => "worker-shutdown",
            Self::MalformedPayload => "malformed-payload",
            Self::ResourceUnavailable => "resource-unavailable",
            Self::InternalError => "internal-error",
            Self::Superseded => "superseded",
        }
    }

    /// Look a status up by its numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Look a status up by its symbolic name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == name)
    }

    /// Returns true for the one status that means the task succeeded.
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusCode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| CoreError::UnknownStatus(s.to_string()))
    }
}

impl TryFrom<i32> for StatusCode {
    type Error = CoreError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| CoreError::UnknownStatus(code.to_string()))
    }
}

impl From<StatusCode> for i32 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}
