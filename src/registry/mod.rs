//! Index registry and sync orchestration.
//!
//! [`SearchSyncBuilder`] turns configuration plus the content store's post
//! types and taxonomies into a set of indices, enables the synced ones and
//! wires one watcher to each enabled single-kind index. Extension happens
//! through ordered transformer lists that run once, inside `build`. The
//! resulting [`SearchSync`] is an explicit context object handed to whoever
//! needs it.

pub mod stats;

pub use stats::{StatsSnapshot, SyncStats};

use crate::client::{ClientFactory, SearchClient};
use crate::config::{Config, SyncMode};
use crate::content::{ContentStore, EntityKind, PostType};
use crate::error::{Result, SyncError};
use crate::index::{
    BatchReport, DriftReport, ReindexOptions, ReindexProgress, ReindexReport, SearchIndex,
};
use crate::outbox::{DrainReport, Outbox};
use crate::watcher::{
    ChangesWatcher, ContentEvent, OperationSink, PostChangesWatcher, TermChangesWatcher,
    UserChangesWatcher, WatcherCore,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type PostTypesTransformer = Box<dyn Fn(Vec<PostType>) -> Vec<PostType> + Send + Sync>;
pub type IndicesTransformer = Box<dyn Fn(Vec<SearchIndex>) -> Vec<SearchIndex> + Send + Sync>;
pub type WatchersTransformer = Box<
    dyn Fn(Vec<Box<dyn ChangesWatcher>>, &WatcherContext) -> Vec<Box<dyn ChangesWatcher>>
        + Send
        + Sync,
>;

/// Everything a watcher needs besides its index
#[derive(Clone)]
pub struct WatcherContext {
    pub store: Arc<dyn ContentStore>,
    pub sink: OperationSink,
    pub watched_meta_keys: Vec<String>,
}

impl WatcherContext {
    pub fn core_for(&self, index: Arc<SearchIndex>) -> WatcherCore {
        WatcherCore::new(index, self.store.clone(), self.sink.clone())
    }

    /// The default watcher for an index, or `None` for mixed-kind indices
    pub fn watcher_for(&self, index: &Arc<SearchIndex>) -> Result<Option<Box<dyn ChangesWatcher>>> {
        let Some(kind) = index.single_kind() else {
            return Ok(None);
        };
        let core = self.core_for(index.clone());
        let watcher: Box<dyn ChangesWatcher> = match kind {
            EntityKind::Post => Box::new(PostChangesWatcher::new(core, &self.watched_meta_keys)?),
            EntityKind::Term => Box::new(TermChangesWatcher::new(core)),
            EntityKind::User => Box::new(UserChangesWatcher::new(core)),
        };
        Ok(Some(watcher))
    }
}

pub struct SearchSyncBuilder {
    config: Config,
    store: Arc<dyn ContentStore>,
    client: Option<Option<Arc<dyn SearchClient>>>,
    post_types_transformers: Vec<PostTypesTransformer>,
    indices_transformers: Vec<IndicesTransformer>,
    watchers_transformers: Vec<WatchersTransformer>,
}

impl SearchSyncBuilder {
    pub fn new(config: &Config, store: Arc<dyn ContentStore>) -> Self {
        Self {
            config: config.clone(),
            store,
            client: None,
            post_types_transformers: Vec::new(),
            indices_transformers: Vec::new(),
            watchers_transformers: Vec::new(),
        }
    }

    /// Use this client instead of creating one from the configured credentials.
    /// `None` disables sync.
    pub fn with_client(mut self, client: Option<Arc<dyn SearchClient>>) -> Self {
        self.client = Some(client);
        self
    }

    /// Adjust the post types making up the `searchable_posts` index
    pub fn filter_searchable_post_types<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<PostType>) -> Vec<PostType> + Send + Sync + 'static,
    {
        self.post_types_transformers.push(Box::new(f));
        self
    }

    /// Adjust the index set before it is wired
    pub fn filter_indices<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<SearchIndex>) -> Vec<SearchIndex> + Send + Sync + 'static,
    {
        self.indices_transformers.push(Box::new(f));
        self
    }

    /// Adjust the watcher set before it is registered
    pub fn filter_watchers<F>(mut self, f: F) -> Self
    where
        F: Fn(Vec<Box<dyn ChangesWatcher>>, &WatcherContext) -> Vec<Box<dyn ChangesWatcher>>
            + Send
            + Sync
            + 'static,
    {
        self.watchers_transformers.push(Box::new(f));
        self
    }

    fn load_indices(&self) -> Result<Vec<SearchIndex>> {
        let sync = &self.config.sync;
        let post_types = self.store.post_types()?;
        let taxonomies = self.store.taxonomies()?;

        let searchable: Vec<PostType> = post_types
            .iter()
            .filter(|p| !p.exclude_from_search)
            .cloned()
            .collect();
        let searchable = self
            .post_types_transformers
            .iter()
            .fold(searchable, |types, f| f(types));

        let mut indices = vec![SearchIndex::searchable_posts(searchable)];
        indices.extend(
            post_types
                .iter()
                .filter(|p| !sync.post_types_blacklist.contains(&p.name))
                .map(SearchIndex::posts),
        );
        indices.extend(
            taxonomies
                .iter()
                .filter(|t| !sync.taxonomies_blacklist.contains(&t.name))
                .map(SearchIndex::terms),
        );
        indices.push(SearchIndex::users());
        Ok(indices)
    }

    pub fn build(self) -> Result<SearchSync> {
        let client = match self.client.clone() {
            Some(client) => client,
            None => ClientFactory::from_config(&self.config.client).create(
                &self.config.algolia.application_id,
                &self.config.algolia.api_key,
            ),
        };

        let indices = self.load_indices()?;
        let indices = self
            .indices_transformers
            .iter()
            .fold(indices, |indices, f| f(indices));

        let mut seen = HashSet::new();
        let mut wired = Vec::with_capacity(indices.len());
        for mut index in indices {
            if !seen.insert(index.id().to_string()) {
                warn!(index = %index.id(), "Duplicate index id; keeping the first");
                continue;
            }
            index.set_name_prefix(self.config.algolia.index_name_prefix.clone());
            index.set_client(client.clone());
            index.set_batch_size(self.config.sync.batch_size);
            if self.config.sync.is_synced(index.id()) {
                index.set_enabled(true);
            }
            wired.push(Arc::new(index));
        }

        for id in &self.config.sync.synced_indices {
            if !seen.contains(id) {
                warn!(index = %id, "Synced index does not exist");
            }
        }

        let outbox_path = PathBuf::from(&self.config.sync.outbox_path);
        let sink = match self.config.sync.mode {
            SyncMode::Immediate => OperationSink::Immediate,
            SyncMode::Outbox => OperationSink::Outbox(Arc::new(Outbox::open(&outbox_path)?)),
        };
        let context = WatcherContext {
            store: self.store.clone(),
            sink,
            watched_meta_keys: self.config.sync.watched_meta_keys.clone(),
        };

        // Without a client sync is off: events are ignored rather than
        // reported as failures
        let mut watchers = Vec::new();
        if client.is_some() {
            for index in wired.iter().filter(|i| i.is_enabled()) {
                match context.watcher_for(index)? {
                    Some(watcher) => watchers.push(watcher),
                    None => debug!(index = %index.id(), "Mixed-kind index has no default watcher"),
                }
            }
            watchers = self
                .watchers_transformers
                .iter()
                .fold(watchers, |watchers, f| f(watchers, &context));
        } else {
            info!("No search client configured; sync disabled");
        }

        let mut sync = SearchSync {
            indices: wired,
            watchers: BTreeMap::new(),
            context,
            store: self.store,
            sync_enabled: client.is_some(),
            outbox_path,
            stats: SyncStats::default(),
        };
        for watcher in watchers {
            sync.watch(watcher);
        }

        info!(
            indices = sync.indices.len(),
            enabled = sync.indices.iter().filter(|i| i.is_enabled()).count(),
            watchers = sync.watchers.len(),
            sync_enabled = sync.sync_enabled,
            "Search sync initialized"
        );
        Ok(sync)
    }
}

/// Selection for [`SearchSync::get_indices`]
#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    pub enabled: Option<bool>,
    /// Keep only indices holding exclusively this kind
    pub contains: Option<EntityKind>,
}

impl IndexFilter {
    pub fn matches(&self, index: &SearchIndex) -> bool {
        self.enabled.is_none_or(|e| index.is_enabled() == e)
            && self.contains.is_none_or(|k| index.contains_only(k))
    }
}

/// Admin view of an index
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub id: String,
    pub label: String,
    pub remote_name: String,
    pub enabled: bool,
    pub kinds: Vec<EntityKind>,
    pub watched: bool,
}

/// Outcome of dispatching events to every watcher
#[derive(Debug, Default, Serialize)]
pub struct DispatchReport {
    pub events: usize,
    /// Per index id, only for indices that had something to do
    pub indices: BTreeMap<String, BatchReport>,
    /// Watcher failures per index id
    pub errors: BTreeMap<String, String>,
}

impl DispatchReport {
    pub fn remote_calls(&self) -> usize {
        self.indices.values().map(|r| r.remote_calls).sum()
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty() && self.indices.values().all(|r| r.failed.is_empty())
    }
}

pub struct SearchSync {
    indices: Vec<Arc<SearchIndex>>,
    watchers: BTreeMap<String, Box<dyn ChangesWatcher>>,
    context: WatcherContext,
    store: Arc<dyn ContentStore>,
    sync_enabled: bool,
    outbox_path: PathBuf,
    stats: SyncStats,
}

impl SearchSync {
    /// False when no client could be created (missing credentials)
    pub fn is_sync_enabled(&self) -> bool {
        self.sync_enabled
    }

    pub fn get_indices(&self, filter: &IndexFilter) -> Vec<Arc<SearchIndex>> {
        self.indices
            .iter()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect()
    }

    pub fn get_index(&self, id: &str) -> Option<Arc<SearchIndex>> {
        self.indices.iter().find(|i| i.id() == id).cloned()
    }

    fn require_index(&self, id: &str) -> Result<Arc<SearchIndex>> {
        self.get_index(id)
            .ok_or_else(|| SyncError::Configuration(format!("unknown index `{}`", id)))
    }

    pub fn summary(&self, index: &SearchIndex) -> IndexSummary {
        IndexSummary {
            id: index.id().to_string(),
            label: index.label().to_string(),
            remote_name: index.remote_name(),
            enabled: index.is_enabled(),
            kinds: index.kinds(),
            watched: self.watchers.contains_key(index.id()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn watcher_ids(&self) -> Vec<String> {
        self.watchers.keys().cloned().collect()
    }

    pub fn watcher(&self, index_id: &str) -> Option<&dyn ChangesWatcher> {
        self.watchers.get(index_id).map(|w| w.as_ref())
    }

    /// Register a watcher. Returns false if its index already has one.
    pub fn watch(&mut self, watcher: Box<dyn ChangesWatcher>) -> bool {
        let id = watcher.index().id().to_string();
        if self.watchers.contains_key(&id) {
            warn!(index = %id, watcher = watcher.name(), "Index already watched; ignoring watcher");
            return false;
        }
        debug!(index = %id, watcher = watcher.name(), "Watcher attached");
        self.watchers.insert(id, watcher);
        true
    }

    pub fn unwatch(&mut self, index_id: &str) -> bool {
        let removed = self.watchers.remove(index_id).is_some();
        if removed {
            debug!(index = %index_id, "Watcher detached");
        }
        removed
    }

    /// Enable or disable an index and attach or detach its default watcher.
    pub fn set_index_enabled(&mut self, id: &str, enabled: bool) -> Result<()> {
        let index = self.require_index(id)?;
        index.set_enabled(enabled);
        if enabled && self.sync_enabled {
            if let Some(watcher) = self.context.watcher_for(&index)? {
                self.watch(watcher);
            }
        } else {
            self.unwatch(id);
        }
        info!(index = %id, enabled, "Index toggled");
        Ok(())
    }

    /// Hand one event to every watcher
    pub fn dispatch(&self, event: &ContentEvent) -> DispatchReport {
        self.stats.record_events(1);
        self.collect(1, |watcher| watcher.handle(event))
    }

    /// Hand a burst of events to every watcher, which coalesces them into
    /// as few batch calls as possible
    pub fn dispatch_burst(&self, events: &[ContentEvent]) -> DispatchReport {
        self.stats.record_events(events.len());
        self.collect(events.len(), |watcher| watcher.handle_burst(events))
    }

    fn collect<F>(&self, events: usize, mut run: F) -> DispatchReport
    where
        F: FnMut(&dyn ChangesWatcher) -> Result<BatchReport>,
    {
        let mut report = DispatchReport {
            events,
            ..Default::default()
        };
        for (id, watcher) in &self.watchers {
            match run(watcher.as_ref()) {
                Ok(batch) => {
                    self.stats.record_batch(&batch);
                    if !batch.is_empty() {
                        report.indices.insert(id.clone(), batch);
                    }
                }
                Err(e) => {
                    warn!(index = %id, watcher = watcher.name(), error = %e, "Watcher failed");
                    self.stats.record_watcher_error();
                    report.errors.insert(id.clone(), e.to_string());
                }
            }
        }
        report
    }

    pub fn reindex<F>(&self, id: &str, options: &ReindexOptions, on_page: F) -> Result<ReindexReport>
    where
        F: FnMut(&ReindexProgress),
    {
        let index = self.require_index(id)?;
        let report = index.reindex_with(self.store.as_ref(), options, on_page)?;
        self.stats.record_reindex(
            report.upserted,
            report.deleted,
            report.failed.len(),
            report.remote_calls,
        );
        Ok(report)
    }

    pub fn check_drift(&self, id: &str) -> Result<DriftReport> {
        self.require_index(id)?
            .check_drift(self.store.as_ref(), ReindexOptions::default().page_size)
    }

    /// Replay the outbox through the indices
    pub fn drain_outbox(&self) -> Result<DrainReport> {
        if !self.sync_enabled {
            return Err(SyncError::Configuration(
                "no search client configured; refusing to drain the outbox".to_string(),
            ));
        }
        let outbox = match &self.context.sink {
            OperationSink::Outbox(outbox) => outbox.clone(),
            OperationSink::Immediate => Arc::new(Outbox::open(&self.outbox_path)?),
        };
        let report = outbox.drain(|index_id, operations| {
            let batch = self.require_index(index_id)?.apply(operations)?;
            self.stats.record_batch(&batch);
            Ok(batch)
        })?;
        Ok(report)
    }
}
