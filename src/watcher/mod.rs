//! Changes watchers: turn content events into sync operations for one index.
//!
//! A watcher plans operations for an event (resolving the entity through the
//! content store), then delivers them either straight to the index or to the
//! outbox. Events of kinds a watcher does not care about plan to nothing.

pub mod post;
pub mod term;
pub mod user;

pub use post::PostChangesWatcher;
pub use term::TermChangesWatcher;
pub use user::UserChangesWatcher;

use crate::content::{ContentStore, Entity, EntityRef};
use crate::error::Result;
use crate::index::{dedupe_operations, BatchReport, SearchIndex, SyncOperation};
use crate::outbox::Outbox;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
    StatusChanged { from: String, to: String },
    MetaUpdated { key: String },
    /// Terms of `taxonomy` were (re)assigned to the target post
    TermsAssigned { taxonomy: String, term_ids: Vec<u64> },
}

/// A content lifecycle notification from the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentEvent {
    pub action: ChangeAction,
    pub target: EntityRef,
    /// State before the change, when the host knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Entity>,
}

impl ContentEvent {
    pub fn new(action: ChangeAction, target: EntityRef) -> Self {
        Self {
            action,
            target,
            before: None,
            after: None,
        }
    }

    pub fn created(target: EntityRef) -> Self {
        Self::new(ChangeAction::Created, target)
    }

    pub fn updated(target: EntityRef) -> Self {
        Self::new(ChangeAction::Updated, target)
    }

    pub fn deleted(target: EntityRef) -> Self {
        Self::new(ChangeAction::Deleted, target)
    }

    pub fn status_changed(target: EntityRef, from: &str, to: &str) -> Self {
        Self::new(
            ChangeAction::StatusChanged {
                from: from.to_string(),
                to: to.to_string(),
            },
            target,
        )
    }

    pub fn meta_updated(target: EntityRef, key: &str) -> Self {
        Self::new(ChangeAction::MetaUpdated { key: key.to_string() }, target)
    }

    pub fn terms_assigned(post_id: u64, taxonomy: &str, term_ids: Vec<u64>) -> Self {
        Self::new(
            ChangeAction::TermsAssigned {
                taxonomy: taxonomy.to_string(),
                term_ids,
            },
            EntityRef::post(post_id),
        )
    }

    pub fn with_before(mut self, entity: Entity) -> Self {
        self.before = Some(entity);
        self
    }

    pub fn with_after(mut self, entity: Entity) -> Self {
        self.after = Some(entity);
        self
    }

    /// Posts referenced by the before/after snapshots
    pub(crate) fn snapshot_posts(&self) -> impl Iterator<Item = &crate::content::Post> {
        self.before
            .iter()
            .chain(self.after.iter())
            .filter_map(Entity::as_post)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherState {
    Idle,
    Handling,
}

/// Marks a watcher as handling until dropped, including on early return
struct HandlingGuard<'a>(&'a AtomicBool);

impl<'a> HandlingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for HandlingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Where planned operations go
#[derive(Clone)]
pub enum OperationSink {
    Immediate,
    Outbox(Arc<Outbox>),
}

/// State shared by every watcher kind
pub struct WatcherCore {
    index: Arc<SearchIndex>,
    store: Arc<dyn ContentStore>,
    sink: OperationSink,
    handling: AtomicBool,
}

impl WatcherCore {
    pub fn new(index: Arc<SearchIndex>, store: Arc<dyn ContentStore>, sink: OperationSink) -> Self {
        Self {
            index,
            store,
            sink,
            handling: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> &Arc<SearchIndex> {
        &self.index
    }

    pub fn store(&self) -> &dyn ContentStore {
        self.store.as_ref()
    }

    /// Re-read `target` and decide again. A vanished entity is deleted.
    pub fn plan_resync(&self, target: EntityRef) -> Result<Option<SyncOperation>> {
        match self.store.entity(target)? {
            Some(entity) => self.index.plan_entity(&entity),
            None => {
                debug!(entity = %target, "Entity not found; deleting its record");
                Ok(Some(SyncOperation::delete(target.object_id())))
            }
        }
    }

    /// Resync `target`, and delete its record when the `before` snapshot shows
    /// the entity used to belong to this index but no longer does (post type
    /// changed, turned into a revision).
    pub fn plan_change(&self, target: EntityRef, before: Option<&Entity>) -> Result<Option<SyncOperation>> {
        let op = self.plan_resync(target)?;
        if op.is_none() && before.is_some_and(|b| self.index.indexable().accepts(b)) {
            debug!(entity = %target, index = %self.index.id(), "Entity left this index; deleting its record");
            return Ok(Some(SyncOperation::delete(target.object_id())));
        }
        Ok(op)
    }

    /// Delete without a store lookup. The `before` snapshot, when present,
    /// only filters out entities this index never held.
    pub fn plan_delete(&self, target: EntityRef, before: Option<&Entity>) -> Option<SyncOperation> {
        match before {
            Some(entity) if !self.index.indexable().accepts(entity) => None,
            _ => Some(SyncOperation::delete(target.object_id())),
        }
    }

    /// Resync several entities of one kind, skipping duplicates
    pub fn plan_resync_all(&self, targets: BTreeSet<EntityRef>) -> Result<Vec<SyncOperation>> {
        let mut operations = Vec::new();
        for target in targets {
            operations.extend(self.plan_resync(target)?);
        }
        Ok(operations)
    }

    pub fn deliver(&self, operations: Vec<SyncOperation>) -> Result<BatchReport> {
        let operations = dedupe_operations(operations);
        if operations.is_empty() {
            return Ok(BatchReport::default());
        }
        match &self.sink {
            OperationSink::Immediate => self.index.apply(operations),
            OperationSink::Outbox(outbox) => {
                let queued = outbox.enqueue(self.index.id(), operations)?;
                Ok(BatchReport {
                    queued,
                    ..Default::default()
                })
            }
        }
    }
}

pub trait ChangesWatcher: Send + Sync {
    fn core(&self) -> &WatcherCore;

    fn name(&self) -> &'static str;

    /// Operations this watcher's index needs after `event`
    fn plan(&self, event: &ContentEvent) -> Result<Vec<SyncOperation>>;

    fn index(&self) -> &Arc<SearchIndex> {
        self.core().index()
    }

    fn state(&self) -> WatcherState {
        if self.core().handling.load(Ordering::SeqCst) {
            WatcherState::Handling
        } else {
            WatcherState::Idle
        }
    }

    /// Plan and deliver one event. Remote failures surface as errors.
    fn handle(&self, event: &ContentEvent) -> Result<BatchReport> {
        let core = self.core();
        if !core.index.is_enabled() {
            return Ok(BatchReport::default());
        }
        let _guard = HandlingGuard::enter(&core.handling);
        let operations = self.plan(event)?;
        core.deliver(operations)?.into_result(&core.index.remote_name())
    }

    /// Plan a burst of events and deliver the deduplicated operations in as
    /// few batches as possible. An event that fails to plan is reported as
    /// failed and does not prevent the others from being delivered.
    fn handle_burst(&self, events: &[ContentEvent]) -> Result<BatchReport> {
        let core = self.core();
        if !core.index.is_enabled() {
            return Ok(BatchReport::default());
        }
        let _guard = HandlingGuard::enter(&core.handling);

        let mut planning_failures = BatchReport::default();
        let mut operations = Vec::new();
        for event in events {
            match self.plan(event) {
                Ok(ops) => operations.extend(ops),
                Err(e) => {
                    warn!(
                        watcher = self.name(),
                        index = %core.index.id(),
                        entity = %event.target,
                        error = %e,
                        "Failed to plan event"
                    );
                    planning_failures.record_failure(event.target.object_id(), e.to_string());
                }
            }
        }

        let mut report = core.deliver(operations)?;
        report.merge(planning_failures);
        Ok(report)
    }
}
