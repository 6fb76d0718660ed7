//! In-process remote store.
//!
//! Behaves like the remote service (idempotent upserts, deletes of absent
//! objects succeed) and records recent calls, which makes it the client of
//! choice for dry runs and tests. Failures can be injected per object id or
//! for the whole service.

use super::{BatchOperation, RemoteError, RemoteErrorKind, SearchClient};
use crate::index::Record;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    SaveObjects,
    DeleteObjects,
    Batch,
    Browse,
}

impl CallKind {
    pub fn is_write(&self) -> bool {
        !matches!(self, CallKind::Browse)
    }
}

/// One call received by the store
#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub index_name: String,
    pub kind: CallKind,
    pub object_ids: Vec<String>,
}

/// Calls kept in the log; older ones are dropped first
pub const DEFAULT_CALL_LOG_LIMIT: usize = 10_000;

struct MemoryState {
    indices: HashMap<String, BTreeMap<String, Record>>,
    calls: VecDeque<RemoteCall>,
    call_log_limit: usize,
    rejected_ids: HashSet<String>,
    unavailable: bool,
}

impl MemoryState {
    fn log(&mut self, call: RemoteCall) {
        if self.calls.len() >= self.call_log_limit {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }
}

pub struct MemorySearchClient {
    state: Mutex<MemoryState>,
}

impl Default for MemorySearchClient {
    fn default() -> Self {
        Self::with_call_log_limit(DEFAULT_CALL_LOG_LIMIT)
    }
}

impl MemorySearchClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_log_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                indices: HashMap::new(),
                calls: VecDeque::new(),
                call_log_limit: limit.max(1),
                rejected_ids: HashSet::new(),
                unavailable: false,
            }),
        }
    }

    /// Current records of an index, ordered by objectID
    pub fn records(&self, index_name: &str) -> Vec<Record> {
        self.lock()
            .indices
            .get(index_name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, index_name: &str, object_id: &str) -> Option<Record> {
        self.lock()
            .indices
            .get(index_name)
            .and_then(|m| m.get(object_id).cloned())
    }

    pub fn object_ids(&self, index_name: &str) -> Vec<String> {
        self.lock()
            .indices
            .get(index_name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Logged calls, oldest first
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.iter().cloned().collect()
    }

    /// Number of calls that could modify remote state
    pub fn write_calls(&self) -> usize {
        self.lock().calls.iter().filter(|c| c.kind.is_write()).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Store records directly, without logging a call
    pub fn seed(&self, index_name: &str, records: Vec<Record>) {
        let mut state = self.lock();
        let index = state.indices.entry(index_name.to_string()).or_default();
        for record in records {
            index.insert(record.object_id.clone(), record);
        }
    }

    /// Any write request touching this objectID is rejected as a whole
    pub fn reject_object(&self, object_id: &str) {
        self.lock().rejected_ids.insert(object_id.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(
        &self,
        index_name: &str,
        kind: CallKind,
        operations: Vec<BatchOperation>,
    ) -> Result<(), RemoteError> {
        let mut state = self.lock();
        state.log(RemoteCall {
            index_name: index_name.to_string(),
            kind,
            object_ids: operations.iter().map(|o| o.object_id().to_string()).collect(),
        });

        if state.unavailable {
            return Err(RemoteError::new(
                RemoteErrorKind::Network,
                "search service unreachable",
            ));
        }
        if let Some(rejected) = operations
            .iter()
            .find(|o| state.rejected_ids.contains(o.object_id()))
        {
            return Err(RemoteError::with_status(
                400,
                format!("record {} rejected", rejected.object_id()),
            ));
        }

        let index = state.indices.entry(index_name.to_string()).or_default();
        for operation in operations {
            match operation {
                BatchOperation::Upsert(record) => {
                    index.insert(record.object_id.clone(), record);
                }
                BatchOperation::Delete(key) => {
                    index.remove(&key.object_id);
                }
            }
        }
        Ok(())
    }
}

impl SearchClient for MemorySearchClient {
    fn save_objects(&self, index_name: &str, records: &[Record]) -> Result<(), RemoteError> {
        let operations = records.iter().cloned().map(BatchOperation::Upsert).collect();
        self.apply(index_name, CallKind::SaveObjects, operations)
    }

    fn delete_objects(&self, index_name: &str, object_ids: &[String]) -> Result<(), RemoteError> {
        let operations = object_ids.iter().map(BatchOperation::delete).collect();
        self.apply(index_name, CallKind::DeleteObjects, operations)
    }

    fn batch(&self, index_name: &str, operations: &[BatchOperation]) -> Result<(), RemoteError> {
        self.apply(index_name, CallKind::Batch, operations.to_vec())
    }

    fn browse(&self, index_name: &str) -> Result<Vec<Record>, RemoteError> {
        let mut state = self.lock();
        state.log(RemoteCall {
            index_name: index_name.to_string(),
            kind: CallKind::Browse,
            object_ids: Vec::new(),
        });
        if state.unavailable {
            return Err(RemoteError::new(
                RemoteErrorKind::Network,
                "search service unreachable",
            ));
        }
        Ok(state
            .indices
            .get(index_name)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_absent_object_succeeds() {
        let client = MemorySearchClient::new();
        assert!(client
            .delete_objects("wp_users", &["user_9".to_string()])
            .is_ok());
        assert!(client.records("wp_users").is_empty());
        assert_eq!(client.write_calls(), 1);
    }

    #[test]
    fn test_rejected_object_fails_whole_request() {
        let client = MemorySearchClient::new();
        client.reject_object("post_2");
        let ops = vec![
            BatchOperation::Upsert(Record::new("post_1")),
            BatchOperation::Upsert(Record::new("post_2")),
        ];
        let err = client.batch("wp_posts_post", &ops).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Rejected);
        assert!(client.records("wp_posts_post").is_empty());
    }

    #[test]
    fn test_call_log_is_bounded() {
        let client = MemorySearchClient::with_call_log_limit(3);
        for i in 0..5 {
            client
                .delete_objects("wp_users", &[format!("user_{}", i)])
                .unwrap();
        }
        let calls = client.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].object_ids, vec!["user_2"]);
        assert_eq!(calls[2].object_ids, vec!["user_4"]);
    }

    #[test]
    fn test_browse_is_not_a_write() {
        let client = MemorySearchClient::new();
        client.seed("wp_users", vec![Record::new("user_1")]);
        assert_eq!(client.browse("wp_users").unwrap().len(), 1);
        assert_eq!(client.write_calls(), 0);
        assert_eq!(client.calls().len(), 1);
    }
}
