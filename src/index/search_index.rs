//! A named remote index bound to one indexable adapter.

use super::{
    BatchReport, CompositeIndexable, Decision, Indexable, PostsIndexable, SyncOperation,
    TermsIndexable, UsersIndexable,
};
use crate::client::{BatchOperation, RemoteError, RemoteErrorKind, SearchClient};
use crate::content::{Entity, EntityKind, PostType, Taxonomy};
use crate::error::{Result, SyncError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub const SEARCHABLE_POSTS_INDEX_ID: &str = "searchable_posts";
pub const USERS_INDEX_ID: &str = "users";

const DEFAULT_BATCH_SIZE: usize = 100;

pub struct SearchIndex {
    id: String,
    label: String,
    name_prefix: String,
    enabled: AtomicBool,
    batch_size: usize,
    client: Option<Arc<dyn SearchClient>>,
    indexable: Box<dyn Indexable>,
}

impl SearchIndex {
    pub fn new(id: impl Into<String>, label: impl Into<String>, indexable: Box<dyn Indexable>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            name_prefix: String::new(),
            enabled: AtomicBool::new(false),
            batch_size: DEFAULT_BATCH_SIZE,
            client: None,
            indexable,
        }
    }

    /// `posts_{type}`: every post of one post type
    pub fn posts(post_type: &PostType) -> Self {
        Self::new(
            format!("posts_{}", post_type.name),
            label_or_name(&post_type.label, &post_type.name),
            Box::new(PostsIndexable::new(std::slice::from_ref(post_type))),
        )
    }

    /// Posts of every type that takes part in front-end search
    pub fn searchable_posts(post_types: Vec<PostType>) -> Self {
        Self::new(
            SEARCHABLE_POSTS_INDEX_ID,
            "All posts",
            Box::new(PostsIndexable::new(&post_types)),
        )
    }

    pub fn terms(taxonomy: &Taxonomy) -> Self {
        Self::new(
            format!("terms_{}", taxonomy.name),
            label_or_name(&taxonomy.label, &taxonomy.name),
            Box::new(TermsIndexable::new(taxonomy.name.clone())),
        )
    }

    pub fn users() -> Self {
        Self::new(USERS_INDEX_ID, "Users", Box::new(UsersIndexable))
    }

    /// One index over several adapters, e.g. posts and terms side by side
    pub fn composite(
        id: impl Into<String>,
        label: impl Into<String>,
        children: Vec<Box<dyn Indexable>>,
    ) -> Self {
        Self::new(id, label, Box::new(CompositeIndexable::new(children)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kinds(&self) -> Vec<EntityKind> {
        self.indexable.kinds()
    }

    /// True only when `kind` is the sole kind this index holds
    pub fn contains_only(&self, kind: EntityKind) -> bool {
        self.kinds() == [kind]
    }

    pub fn single_kind(&self) -> Option<EntityKind> {
        match self.kinds().as_slice() {
            [kind] => Some(*kind),
            _ => None,
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_name_prefix(&mut self, prefix: impl Into<String>) {
        self.name_prefix = prefix.into();
    }

    /// Name of the index on the remote service
    pub fn remote_name(&self) -> String {
        format!("{}{}", self.name_prefix, self.id)
    }

    pub fn set_client(&mut self, client: Option<Arc<dyn SearchClient>>) {
        self.client = client;
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn indexable(&self) -> &dyn Indexable {
        self.indexable.as_ref()
    }

    pub(crate) fn require_client(&self) -> Result<&Arc<dyn SearchClient>> {
        self.client.as_ref().ok_or_else(|| {
            SyncError::Configuration(format!("index `{}` has no search client", self.id))
        })
    }

    pub(crate) fn remote_unavailable(&self, source: RemoteError) -> SyncError {
        SyncError::RemoteUnavailable {
            index: self.remote_name(),
            source,
        }
    }

    /// What this index wants done with `entity`; `None` when it is not ours.
    pub fn plan_entity(&self, entity: &Entity) -> Result<Option<SyncOperation>> {
        Ok(match self.indexable.decide(entity)? {
            Decision::Skip => None,
            Decision::Delete => Some(SyncOperation::delete(entity.entity_ref().object_id())),
            Decision::Upsert(record) => Some(SyncOperation::upsert(record)),
        })
    }

    /// Upsert `entity` when indexable, delete its record otherwise.
    pub fn index_entity(&self, entity: &Entity) -> Result<BatchReport> {
        match self.plan_entity(entity)? {
            Some(op) => self.apply(vec![op])?.into_result(&self.remote_name()),
            None => Ok(BatchReport::default()),
        }
    }

    pub fn delete_record(&self, object_id: &str) -> Result<BatchReport> {
        self.apply(vec![SyncOperation::delete(object_id)])?
            .into_result(&self.remote_name())
    }

    /// Send operations to the remote index, `batch_size` per call.
    ///
    /// A failed chunk is recorded in the report and does not stop the chunks
    /// after it. When the service rejects a chunk because of its content, the
    /// chunk is split until the rejected records are isolated, so only those
    /// end up in `failed`. Only a missing client is an error here.
    pub fn apply(&self, operations: Vec<SyncOperation>) -> Result<BatchReport> {
        let client = self.require_client()?;
        let name = self.remote_name();
        let mut report = BatchReport::default();

        for chunk in operations.chunks(self.batch_size) {
            send(client.as_ref(), &name, chunk, &mut report);
        }

        Ok(report)
    }
}

/// One request for `ops`: a direct call for a single operation, a batch
/// otherwise. Rejected batches are bisected.
fn send(client: &dyn SearchClient, index_name: &str, ops: &[SyncOperation], report: &mut BatchReport) {
    let result = match ops {
        [SyncOperation::Upsert { record }] => {
            client.save_objects(index_name, std::slice::from_ref(record))
        }
        [SyncOperation::Delete { object_id }] => {
            client.delete_objects(index_name, std::slice::from_ref(object_id))
        }
        _ => {
            let batch: Vec<BatchOperation> = ops
                .iter()
                .cloned()
                .map(SyncOperation::into_batch_operation)
                .collect();
            client.batch(index_name, &batch)
        }
    };
    report.remote_calls += 1;

    match result {
        Ok(()) => {
            debug!(index = %index_name, operations = ops.len(), "Batch applied");
            for op in ops {
                match op {
                    SyncOperation::Upsert { record } => report.upserted.push(record.object_id.clone()),
                    SyncOperation::Delete { object_id } => report.deleted.push(object_id.clone()),
                }
            }
        }
        Err(e) if e.kind == RemoteErrorKind::Rejected && ops.len() > 1 => {
            debug!(index = %index_name, operations = ops.len(), error = %e, "Batch rejected; splitting");
            let (left, right) = ops.split_at(ops.len() / 2);
            send(client, index_name, left, report);
            send(client, index_name, right, report);
        }
        Err(e) => {
            warn!(index = %index_name, operations = ops.len(), error = %e, "Batch failed");
            for op in ops {
                report.record_remote_failure(op.object_id(), &e);
            }
            report.last_error = Some(e);
        }
    }
}

fn label_or_name(label: &str, name: &str) -> String {
    if label.trim().is_empty() {
        name.to_string()
    } else {
        label.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{CallKind, MemorySearchClient};
    use crate::content::{Term, User};
    use crate::index::Record;

    fn post_type(name: &str) -> PostType {
        PostType {
            name: name.to_string(),
            label: String::new(),
            exclude_from_search: false,
        }
    }

    fn wired(mut index: SearchIndex, client: &Arc<MemorySearchClient>) -> SearchIndex {
        index.set_name_prefix("wp_");
        index.set_client(Some(client.clone() as Arc<dyn SearchClient>));
        index
    }

    #[test]
    fn test_ids_and_remote_name() {
        let mut index = SearchIndex::posts(&post_type("page"));
        assert_eq!(index.id(), "posts_page");
        assert_eq!(index.label(), "page");
        index.set_name_prefix("wp_");
        assert_eq!(index.remote_name(), "wp_posts_page");
        assert_eq!(SearchIndex::users().id(), "users");
    }

    #[test]
    fn test_contains_only() {
        let posts = SearchIndex::posts(&post_type("post"));
        assert!(posts.contains_only(EntityKind::Post));
        assert!(!posts.contains_only(EntityKind::Term));

        let mixed = SearchIndex::composite(
            "mixed",
            "Mixed",
            vec![
                Box::new(PostsIndexable::new(&[post_type("post")])),
                Box::new(TermsIndexable::new("category")),
            ],
        );
        assert!(!mixed.contains_only(EntityKind::Post));
        assert!(!mixed.contains_only(EntityKind::Term));
        assert_eq!(mixed.single_kind(), None);
    }

    #[test]
    fn test_sync_without_client_is_configuration_error() {
        let index = SearchIndex::users();
        let err = index.delete_record("user_1").unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn test_index_entity_routes_not_indexable_to_delete() {
        let client = Arc::new(MemorySearchClient::new());
        let index = wired(SearchIndex::users(), &client);
        client.seed("wp_users", vec![Record::new("user_3")]);

        let user = Entity::User(User {
            id: 3,
            login: "ghost".into(),
            display_name: "Ghost".into(),
            description: String::new(),
            posts_count: 0,
            posts_url: String::new(),
            avatar_url: String::new(),
        });
        let report = index.index_entity(&user).unwrap();
        assert_eq!(report.deleted, vec!["user_3"]);
        assert!(client.records("wp_users").is_empty());
    }

    #[test]
    fn test_index_entity_skips_foreign_entities() {
        let client = Arc::new(MemorySearchClient::new());
        let index = wired(SearchIndex::users(), &client);
        let term = Entity::Term(Term {
            id: 1,
            taxonomy: "category".into(),
            name: "News".into(),
            slug: "news".into(),
            description: String::new(),
            count: 1,
            permalink: String::new(),
        });
        assert!(index.index_entity(&term).unwrap().is_empty());
        assert!(client.calls().is_empty());
    }

    #[test]
    fn test_apply_isolates_rejected_record() {
        let client = Arc::new(MemorySearchClient::new());
        let mut index = wired(SearchIndex::users(), &client);
        index.set_batch_size(2);
        client.reject_object("user_2");

        let ops: Vec<SyncOperation> = (1..=5)
            .map(|i| SyncOperation::upsert(Record::new(format!("user_{}", i))))
            .collect();
        let report = index.apply(ops).unwrap();

        assert_eq!(report.failed_ids(), vec!["user_2"]);
        assert_eq!(report.upserted, vec!["user_1", "user_3", "user_4", "user_5"]);
        assert_eq!(
            client.object_ids("wp_users"),
            vec!["user_1", "user_3", "user_4", "user_5"]
        );
        // [1,2] rejected, then 1 and 2 alone; [3,4]; 5 alone
        let kinds: Vec<CallKind> = client.calls().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CallKind::Batch,
                CallKind::SaveObjects,
                CallKind::SaveObjects,
                CallKind::Batch,
                CallKind::SaveObjects,
            ]
        );
        assert_eq!(report.remote_calls, 5);
    }

    #[test]
    fn test_apply_rejected_pair() {
        let client = Arc::new(MemorySearchClient::new());
        let mut index = wired(SearchIndex::users(), &client);
        index.set_batch_size(2);
        client.reject_object("user_2");

        let report = index
            .apply(vec![
                SyncOperation::upsert(Record::new("user_1")),
                SyncOperation::upsert(Record::new("user_2")),
            ])
            .unwrap();

        assert_eq!(report.failed_ids(), vec!["user_2"]);
        assert_eq!(report.upserted, vec!["user_1"]);
        assert_eq!(client.object_ids("wp_users"), vec!["user_1"]);
    }

    #[test]
    fn test_apply_outage_fails_whole_chunk_without_splitting() {
        let client = Arc::new(MemorySearchClient::new());
        let mut index = wired(SearchIndex::users(), &client);
        index.set_batch_size(10);
        client.set_unavailable(true);

        let ops: Vec<SyncOperation> = (1..=4)
            .map(|i| SyncOperation::delete(format!("user_{}", i)))
            .collect();
        let report = index.apply(ops).unwrap();

        assert_eq!(report.remote_calls, 1);
        assert_eq!(report.failed.len(), 4);
        assert!(report.last_error.is_some());
    }

    #[test]
    fn test_single_operation_uses_direct_call() {
        let client = Arc::new(MemorySearchClient::new());
        let index = wired(SearchIndex::users(), &client);
        index.delete_record("user_9").unwrap();
        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, CallKind::DeleteObjects);
        assert_eq!(calls[0].object_ids, vec!["user_9"]);
    }
}
