//! Error taxonomy for the sync core.
//!
//! An entity that is not indexable is not an error: the watcher routes it to a
//! delete. Everything that can actually go wrong is a [`SyncError`].

use crate::client::RemoteError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid credentials, or an index used before it was wired.
    /// Sync is disabled; the host keeps running.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network, auth or quota failure reported by the client boundary.
    #[error("remote index `{index}` unavailable: {source}")]
    RemoteUnavailable {
        index: String,
        #[source]
        source: RemoteError,
    },

    /// Local content and the remote index disagree. Only `reindex_all` repairs this.
    #[error(
        "drift detected on `{index}`: {} missing, {} stale, {} outdated",
        missing.len(),
        stale.len(),
        outdated.len()
    )]
    DriftDetected {
        index: String,
        missing: Vec<String>,
        stale: Vec<String>,
        outdated: Vec<String>,
    },

    /// Some operations of a batch failed; the rest were applied.
    #[error("{} operation(s) failed on `{index}`", failed.len())]
    PartialFailure { index: String, failed: Vec<String> },

    #[error("content store error: {0}")]
    ContentStore(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpoint error at {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    #[error("outbox error at {path}: {message}")]
    Outbox { path: PathBuf, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// True for failures of the remote boundary (the ones a host may want to
    /// surface to its user as a warning).
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteUnavailable { .. } | SyncError::PartialFailure { .. }
        )
    }
}
