//! Worker configuration.
//!
//! The configuration is read once at startup, validated, and then shared
//! read-only (`Arc<WorkerConfig>`) with every task the worker runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use scriptrun_core::{ArtifactRuleConfig, ArtifactRules, WorkerId};

use crate::credentials::Credentials;

/// Environment variable that overrides `worker_id`.
pub const WORKER_ID_ENV: &str = "SCRIPTRUN_WORKER_ID";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Provisioner this worker belongs to.
    pub provisioner_id: String,

    /// Worker group.
    pub worker_group: String,

    /// Worker type the queue hands tasks out for.
    pub worker_type: String,

    /// Worker ID.
    pub worker_id: WorkerId,

    /// Initial queue credentials.
    pub credentials: Credentials,

    /// Directory the task command runs in.
    pub work_dir: PathBuf,

    /// Directory the task logs are written to.
    pub log_dir: PathBuf,

    /// Directory the task leaves artifacts in.
    pub artifact_dir: PathBuf,

    /// Command run for every task, program first.
    pub task_script: Vec<String>,

    /// Time between claim renewals.
    #[serde(with = "secs")]
    pub reclaim_interval: Duration,

    /// Upper bound on a single renewal call.
    #[serde(with = "secs")]
    pub reclaim_timeout: Duration,

    /// Time between claim attempts when the queue had nothing.
    #[serde(with = "secs")]
    pub poll_interval: Duration,

    /// Time between credential refreshes.
    #[serde(with = "secs")]
    pub credential_update_interval: Duration,

    /// Hard wall-clock limit for the task command.
    #[serde(with = "secs")]
    pub task_max_timeout: Duration,

    /// Limit for uploading one artifact.
    #[serde(with = "secs")]
    pub artifact_upload_timeout: Duration,

    /// Limit for signing with the worker key.
    #[serde(with = "secs")]
    pub sign_key_timeout: Duration,

    /// How long uploaded artifacts live.
    pub artifact_expiration_hours: u32,

    /// Ordered artifact trust rules.
    pub valid_artifact_rules: ArtifactRules,

    /// Log at debug level.
    pub verbose: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            provisioner_id: "test-dummy-provisioner".to_string(),
            worker_group: "test-dummy-workers".to_string(),
            worker_type: "dummy-worker-myname".to_string(),
            worker_id: WorkerId::new("dummy-worker-myname1"),
            credentials: Credentials::default(),
            work_dir: PathBuf::from("work"),
            log_dir: PathBuf::from("logs"),
            artifact_dir: PathBuf::from("artifacts"),
            task_script: vec![
                "bash".to_string(),
                "-c".to_string(),
                "echo foo && sleep 19 && exit 1".to_string(),
            ],
            reclaim_interval: Duration::from_secs(300),
            reclaim_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            credential_update_interval: Duration::from_secs(300),
            task_max_timeout: Duration::from_secs(60 * 20),
            artifact_upload_timeout: Duration::from_secs(60 * 20),
            sign_key_timeout: Duration::from_secs(60 * 2),
            artifact_expiration_hours: 24,
            valid_artifact_rules: default_artifact_rules(),
            verbose: false,
        }
    }
}

/// The stock rule: artifacts served by the production queue.
fn default_artifact_rules() -> ArtifactRules {
    let rule = ArtifactRuleConfig {
        schemes: vec!["https".to_string()],
        netlocs: vec!["queue.taskcluster.net".to_string()],
        path_regexes: vec![
            r"^/v1/task/(?P<taskId>[^/]+)(/runs/\d+)?/artifacts/(?P<filepath>.*)$".to_string(),
        ],
    };
    // The stock pattern is a constant, so compiling it cannot fail in practice.
    ArtifactRules::try_from(vec![rule]).unwrap_or_default()
}

impl WorkerConfig {
    /// Load a config file, apply environment overrides and validate it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document. Keys that are absent keep their defaults;
    /// artifact rules are compiled here and rejected if malformed.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply overrides from the environment, looked up through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup(WORKER_ID_ENV).filter(|id| !id.is_empty()) {
            self.worker_id = WorkerId::new(id);
        }
    }

    /// Reject configurations a worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.task_script.first() {
            Some(program) if !program.is_empty() => {}
            _ => return Err(ConfigError::Invalid("task_script is empty".to_string())),
        }

        for (name, dir) in [
            ("work_dir", &self.work_dir),
            ("log_dir", &self.log_dir),
            ("artifact_dir", &self.artifact_dir),
        ] {
            if dir.as_os_str().is_empty() || dir == Path::new("...") {
                return Err(ConfigError::Invalid(format!("{name} is not set")));
            }
        }

        for (name, value) in [
            ("reclaim_interval", self.reclaim_interval),
            ("reclaim_timeout", self.reclaim_timeout),
            ("poll_interval", self.poll_interval),
            (
                "credential_update_interval",
                self.credential_update_interval,
            ),
            ("task_max_timeout", self.task_max_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        Ok(())
    }

    /// Tracing level implied by `verbose`.
    pub fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    /// Copy of this config safe to print.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.credentials = config.credentials.redacted();
        config
    }
}

/// Durations written as (possibly fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom(format!("invalid duration: {secs}")));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
