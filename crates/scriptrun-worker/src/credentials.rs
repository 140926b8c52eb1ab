//! Queue credentials.
//!
//! Credentials are rotated by a collaborator; the worker only ever reads a
//! snapshot when it makes a queue call.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REDACTED: &str = "<redacted>";

/// Temporary queue credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub client_id: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            access_token: access_token.into(),
            certificate: None,
        }
    }

    /// Same client id, secrets masked.
    pub fn redacted(&self) -> Self {
        Self {
            client_id: self.client_id.clone(),
            access_token: REDACTED.to_string(),
            certificate: self.certificate.as_ref().map(|_| REDACTED.to_string()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("access_token", &REDACTED)
            .field("certificate", &self.certificate.as_ref().map(|_| REDACTED))
            .finish()
    }
}

/// Source of the current credential snapshot.
pub trait CredentialProvider: Send + Sync {
    fn current(&self) -> Credentials;
}

/// Credentials that never change.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl CredentialProvider for StaticCredentials {
    fn current(&self) -> Credentials {
        self.0.clone()
    }
}

/// Latest credentials, updated in place by whoever rotates them.
#[derive(Debug)]
pub struct CredentialStore {
    tx: watch::Sender<Credentials>,
}

impl CredentialStore {
    pub fn new(initial: Credentials) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the stored credentials.
    pub fn update(&self, credentials: Credentials) {
        self.tx.send_replace(credentials);
    }
}

impl CredentialProvider for CredentialStore {
    fn current(&self) -> Credentials {
        self.tx.borrow().clone()
    }
}

/// Credential refresh errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential refresh failed: {0}")]
    Refresh(String),
}

/// Somewhere fresh credentials can be fetched from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Credentials, CredentialError>;
}

/// Credentials kept in a JSON file that something else rewrites.
#[derive(Debug, Clone)]
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for FileCredentials {
    async fn fetch(&self) -> Result<Credentials, CredentialError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| CredentialError::Refresh(format!("{}: {e}", self.path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| CredentialError::Refresh(format!("{}: {e}", self.path.display())))
    }
}

/// Refresh `store` from `source` every `interval` until `shutdown` fires.
/// A failed refresh keeps the previous credentials.
pub fn spawn_credential_refresh(
    source: Arc<dyn CredentialSource>,
    store: Arc<CredentialStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        // The first tick completes immediately; the initial credentials are
        // already in the store.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Credential refresh stopped");
                    break;
                }
                _ = timer.tick() => {}
            }

            match source.fetch().await {
                Ok(credentials) => {
                    info!(client_id = %credentials.client_id, "Refreshed credentials");
                    store.update(credentials);
                }
                Err(e) => {
                    warn!(error = %e, "Keeping previous credentials");
                }
            }
        }
    })
}
