//! Remote search service boundary.
//!
//! The sync core only needs a narrow interface to the remote store: upsert,
//! delete, mixed batch, and a full browse for drift detection. All retry,
//! backoff and timeout policy lives behind [`SearchClient`], never in indices
//! or watchers.

pub mod algolia;
pub mod factory;
pub mod memory;
pub mod retry;

pub use algolia::AlgoliaClient;
pub use factory::{ClientFactory, UserAgentInfo};
pub use memory::{CallKind, MemorySearchClient, RemoteCall};
pub use retry::RetryPolicy;

use crate::index::Record;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failed remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Network,
    Timeout,
    Unauthorized,
    QuotaExceeded,
    NotFound,
    Server,
    Rejected,
    Decode,
}

impl RemoteErrorKind {
    /// Whether another attempt (possibly on another host) may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteErrorKind::Network
                | RemoteErrorKind::Timeout
                | RemoteErrorKind::QuotaExceeded
                | RemoteErrorKind::Server
        )
    }

    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => RemoteErrorKind::Unauthorized,
            404 => RemoteErrorKind::NotFound,
            429 => RemoteErrorKind::QuotaExceeded,
            500..=599 => RemoteErrorKind::Server,
            _ => RemoteErrorKind::Rejected,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::Network => "network error",
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::Unauthorized => "unauthorized",
            RemoteErrorKind::QuotaExceeded => "quota exceeded",
            RemoteErrorKind::NotFound => "not found",
            RemoteErrorKind::Server => "server error",
            RemoteErrorKind::Rejected => "rejected",
            RemoteErrorKind::Decode => "invalid response",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::from_status(status),
            status: Some(status),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(rename = "objectID")]
    pub object_id: String,
}

/// One entry of a mixed batch request, in the Algolia wire format
/// (`{"action": "updateObject", "body": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "body")]
pub enum BatchOperation {
    #[serde(rename = "updateObject")]
    Upsert(Record),
    #[serde(rename = "deleteObject")]
    Delete(ObjectKey),
}

impl BatchOperation {
    pub fn delete(object_id: impl Into<String>) -> Self {
        BatchOperation::Delete(ObjectKey {
            object_id: object_id.into(),
        })
    }

    pub fn object_id(&self) -> &str {
        match self {
            BatchOperation::Upsert(record) => &record.object_id,
            BatchOperation::Delete(key) => &key.object_id,
        }
    }
}

/// Authenticated handle on the remote search service.
///
/// Deleting an object that does not exist must succeed, and saving an object
/// identical to the stored one must leave the remote state unchanged.
pub trait SearchClient: Send + Sync {
    fn save_objects(&self, index_name: &str, records: &[Record]) -> Result<(), RemoteError>;

    fn delete_objects(&self, index_name: &str, object_ids: &[String]) -> Result<(), RemoteError>;

    fn batch(&self, index_name: &str, operations: &[BatchOperation]) -> Result<(), RemoteError>;

    /// Every record of an index. A missing index browses as empty.
    fn browse(&self, index_name: &str) -> Result<Vec<Record>, RemoteError>;
}
