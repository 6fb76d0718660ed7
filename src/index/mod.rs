pub mod indexable;
pub mod record;
pub mod reindex;
pub mod search_index;

pub use indexable::{
    CompositeIndexable, Decision, Indexable, PostsIndexable, TermsIndexable, UsersIndexable,
};
pub use record::Record;
pub use reindex::{DriftReport, ReindexCheckpoint, ReindexOptions, ReindexProgress, ReindexReport};
pub use search_index::{SearchIndex, SEARCHABLE_POSTS_INDEX_ID, USERS_INDEX_ID};

use crate::client::{BatchOperation, RemoteError, RemoteErrorKind};
use crate::error::SyncError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// An intent against one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SyncOperation {
    Upsert { record: Record },
    Delete { object_id: String },
}

impl SyncOperation {
    pub fn upsert(record: Record) -> Self {
        SyncOperation::Upsert { record }
    }

    pub fn delete(object_id: impl Into<String>) -> Self {
        SyncOperation::Delete {
            object_id: object_id.into(),
        }
    }

    pub fn object_id(&self) -> &str {
        match self {
            SyncOperation::Upsert { record } => &record.object_id,
            SyncOperation::Delete { object_id } => object_id,
        }
    }

    pub fn into_batch_operation(self) -> BatchOperation {
        match self {
            SyncOperation::Upsert { record } => BatchOperation::Upsert(record),
            SyncOperation::Delete { object_id } => BatchOperation::delete(object_id),
        }
    }
}

/// Collapse operations on the same objectID, keeping the last one.
///
/// The relative order of the surviving operations follows their last occurrence.
pub fn dedupe_operations(operations: Vec<SyncOperation>) -> Vec<SyncOperation> {
    let mut last: FxHashMap<String, usize> = FxHashMap::default();
    for (i, op) in operations.iter().enumerate() {
        last.insert(op.object_id().to_string(), i);
    }
    operations
        .into_iter()
        .enumerate()
        .filter(|(i, op)| last.get(op.object_id()) == Some(i))
        .map(|(_, op)| op)
        .collect()
}

/// An operation that did not reach the remote store
#[derive(Debug, Clone, Serialize)]
pub struct FailedOperation {
    pub object_id: String,
    pub reason: String,
    /// The service refused the operation itself; resending it cannot succeed
    pub rejected: bool,
}

/// Outcome of delivering a set of operations to one index
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub upserted: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: Vec<FailedOperation>,
    /// Operations appended to the outbox instead of being sent
    pub queued: usize,
    pub remote_calls: usize,
    #[serde(skip)]
    pub last_error: Option<RemoteError>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.deleted.is_empty() && self.failed.is_empty() && self.queued == 0
    }

    pub fn succeeded(&self) -> usize {
        self.upserted.len() + self.deleted.len()
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.upserted.extend(other.upserted);
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
        self.queued += other.queued;
        self.remote_calls += other.remote_calls;
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
    }

    pub fn record_failure(&mut self, object_id: impl Into<String>, reason: impl Into<String>) {
        self.failed.push(FailedOperation {
            object_id: object_id.into(),
            reason: reason.into(),
            rejected: false,
        });
    }

    pub fn record_remote_failure(&mut self, object_id: impl Into<String>, error: &RemoteError) {
        self.failed.push(FailedOperation {
            object_id: object_id.into(),
            reason: error.to_string(),
            rejected: error.kind == RemoteErrorKind::Rejected,
        });
    }

    pub fn failed_ids(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.object_id.clone()).collect()
    }

    /// Turn failures into an error: `RemoteUnavailable` when nothing got
    /// through, `PartialFailure` when only some operations failed.
    pub fn into_result(self, index_name: &str) -> Result<BatchReport, SyncError> {
        if self.failed.is_empty() {
            return Ok(self);
        }
        if self.succeeded() == 0 && self.queued == 0 {
            if let Some(source) = self.last_error {
                return Err(SyncError::RemoteUnavailable {
                    index: index_name.to_string(),
                    source,
                });
            }
        }
        Err(SyncError::PartialFailure {
            index: index_name.to_string(),
            failed: self.failed_ids(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_keeps_last_operation() {
        let ops = vec![
            SyncOperation::upsert(Record::new("post_1").with("v", 1)),
            SyncOperation::upsert(Record::new("post_2")),
            SyncOperation::upsert(Record::new("post_1").with("v", 2)),
            SyncOperation::delete("post_2"),
        ];
        let deduped = dedupe_operations(ops);
        assert_eq!(deduped.len(), 2);
        assert!(matches!(&deduped[0], SyncOperation::Upsert { record } if record.get("v").unwrap() == 2));
        assert_eq!(deduped[1], SyncOperation::delete("post_2"));
    }

    #[test]
    fn test_operation_serde_shape() {
        let op = SyncOperation::delete("user_3");
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"op":"delete","object_id":"user_3"}"#);
        let back: SyncOperation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_into_result_classifies_failures() {
        let mut total = BatchReport::default();
        total.record_failure("post_1", "timeout");
        total.last_error = Some(RemoteError::new(RemoteErrorKind::Timeout, "timeout"));
        assert!(matches!(
            total.into_result("wp_posts_post"),
            Err(SyncError::RemoteUnavailable { .. })
        ));

        let mut partial = BatchReport::default();
        partial.upserted.push("post_2".into());
        partial.record_failure("post_1", "rejected");
        match partial.into_result("wp_posts_post") {
            Err(SyncError::PartialFailure { failed, .. }) => assert_eq!(failed, vec!["post_1"]),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
