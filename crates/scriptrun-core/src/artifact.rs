//! Artifact URL trust rules.
//!
//! A URL is trusted when one configured [`ArtifactRule`] accepts its scheme,
//! its network location and its path. Path patterns must define the named
//! groups `taskId` and `filepath`; the captured values identify which task
//! produced the artifact and where it lives inside that task's artifacts.
//!
//! Rules are compiled and checked when they are loaded, so a bad pattern
//! fails worker startup instead of the first download.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CoreError;
use crate::TaskId;

/// Capture group naming the producing task.
pub const TASK_ID_GROUP: &str = "taskId";
/// Capture group naming the artifact path relative to the task.
pub const FILE_PATH_GROUP: &str = "filepath";

/// One rule as written in the worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRuleConfig {
    pub schemes: Vec<String>,
    pub netlocs: Vec<String>,
    pub path_regexes: Vec<String>,
}

/// A validated, compiled trust rule.
#[derive(Debug, Clone)]
pub struct ArtifactRule {
    schemes: BTreeSet<String>,
    netlocs: BTreeSet<String>,
    path_patterns: Vec<Regex>,
}

impl ArtifactRule {
    /// Compile a rule from its configuration. `index` is only used to point
    /// at the offending rule in error messages.
    pub fn compile(index: usize, config: &ArtifactRuleConfig) -> Result<Self, CoreError> {
        let invalid = |reason: String| CoreError::InvalidRule { index, reason };

        let schemes = normalized_set(&config.schemes);
        if schemes.is_empty() {
            return Err(invalid("no schemes".to_string()));
        }
        let netlocs = normalized_set(&config.netlocs);
        if netlocs.is_empty() {
            return Err(invalid("no netlocs".to_string()));
        }
        if config.path_regexes.is_empty() {
            return Err(invalid("no path_regexes".to_string()));
        }

        let mut path_patterns = Vec::with_capacity(config.path_regexes.len());
        for pattern in &config.path_regexes {
            let regex = Regex::new(pattern)
                .map_err(|e| invalid(format!("bad pattern {pattern:?}: {e}")))?;
            for group in [TASK_ID_GROUP, FILE_PATH_GROUP] {
                if !regex.capture_names().flatten().any(|name| name == group) {
                    return Err(invalid(format!(
                        "pattern {pattern:?} has no named group `{group}`"
                    )));
                }
            }
            path_patterns.push(regex);
        }

        Ok(Self {
            schemes,
            netlocs,
            path_patterns,
        })
    }

    fn matches(&self, scheme: &str, netloc: &str, path: &str) -> Option<TrustedArtifact> {
        if !self.schemes.contains(scheme) || !self.netlocs.contains(netloc) {
            return None;
        }
        self.path_patterns.iter().find_map(|regex| {
            let caps = regex.captures(path)?;
            let task_id = caps.name(TASK_ID_GROUP)?.as_str();
            let file_path = caps.name(FILE_PATH_GROUP)?.as_str();
            Some(TrustedArtifact {
                task_id: TaskId::new(task_id),
                file_path: file_path.to_string(),
            })
        })
    }
}

impl From<&ArtifactRule> for ArtifactRuleConfig {
    fn from(rule: &ArtifactRule) -> Self {
        Self {
            schemes: rule.schemes.iter().cloned().collect(),
            netlocs: rule.netlocs.iter().cloned().collect(),
            path_regexes: rule
                .path_patterns
                .iter()
                .map(|r| r.as_str().to_string())
                .collect(),
        }
    }
}

fn normalized_set(values: &[String]) -> BTreeSet<String> {
    values
        .iter()
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

/// The ordered rule set a worker checks artifact URLs against.
///
/// Loaded once at startup and shared read-only between tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<ArtifactRuleConfig>", into = "Vec<ArtifactRuleConfig>")]
pub struct ArtifactRules {
    rules: Vec<ArtifactRule>,
}

impl ArtifactRules {
    pub fn new(rules: Vec<ArtifactRule>) -> Self {
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Check `url` against the rules in order. The first rule that accepts
    /// scheme, netloc and path decides; later rules are not consulted.
    pub fn validate(&self, url: &str) -> Option<TrustedArtifact> {
        let parsed = Url::parse(url).ok()?;
        let netloc = netloc(&parsed)?;
        self.rules
            .iter()
            .find_map(|rule| rule.matches(parsed.scheme(), &netloc, parsed.path()))
    }

    /// Like [`validate`](Self::validate) but an untrusted URL is an error.
    pub fn ensure_trusted(&self, url: &str) -> Result<TrustedArtifact, CoreError> {
        self.validate(url)
            .ok_or_else(|| CoreError::UntrustedUrl(url.to_string()))
    }
}

impl TryFrom<Vec<ArtifactRuleConfig>> for ArtifactRules {
    type Error = CoreError;

    fn try_from(configs: Vec<ArtifactRuleConfig>) -> Result<Self, Self::Error> {
        let rules = configs
            .iter()
            .enumerate()
            .map(|(index, config)| ArtifactRule::compile(index, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }
}

impl From<ArtifactRules> for Vec<ArtifactRuleConfig> {
    fn from(rules: ArtifactRules) -> Self {
        rules.rules.iter().map(ArtifactRuleConfig::from).collect()
    }
}

/// `host[:port]`, with userinfo kept in front so that a URL carrying
/// credentials never equals a bare host entry. Default ports are dropped by
/// the URL parser and therefore never appear.
fn netloc(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let mut netloc = String::new();
    if !url.username().is_empty() || url.password().is_some() {
        netloc.push_str(url.username());
        if let Some(password) = url.password() {
            netloc.push(':');
            netloc.push_str(password);
        }
        netloc.push('@');
    }
    netloc.push_str(host);
    if let Some(port) = url.port() {
        let _ = write!(netloc, ":{port}");
    }
    Some(netloc)
}

/// Identifiers extracted from a trusted artifact URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrustedArtifact {
    pub task_id: TaskId,
    pub file_path: String,
}

impl TrustedArtifact {
    /// Where this artifact should land under `base`.
    ///
    /// Absolute paths and `..` components are rejected so a crafted URL can
    /// not write outside `base`.
    pub fn local_path(&self, base: &Path) -> Result<PathBuf, CoreError> {
        let relative = Path::new(&self.file_path);
        let mut out = base.to_path_buf();
        let mut pushed = false;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    pushed = true;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(CoreError::UnsafePath(self.file_path.clone()))
                }
            }
        }
        if !pushed {
            return Err(CoreError::UnsafePath(self.file_path.clone()));
        }
        Ok(out)
    }
}

/// Outcome of checking one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    Trusted { task_id: TaskId, file_path: String },
    Untrusted,
}

impl TrustDecision {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Self::Trusted { .. })
    }
}

/// Decide whether `url` may be used, according to `rules`.
pub fn is_trusted(url: &str, rules: &ArtifactRules) -> TrustDecision {
    match rules.validate(url) {
        Some(TrustedArtifact { task_id, file_path }) => {
            TrustDecision::Trusted { task_id, file_path }
        }
        None => TrustDecision::Untrusted,
    }
}
