//! Full rebuild and drift detection for a [`SearchIndex`].
//!
//! A rebuild compares every indexable entity against a browse of the remote
//! index and only writes what differs, so running it twice in a row leaves the
//! second run with nothing to send. Progress can be checkpointed to disk and a
//! cancelled rebuild resumes where it stopped.

use super::{BatchReport, Decision, FailedOperation, SearchIndex, SyncOperation};
use crate::content::{ContentStore, Entity, EntityRef, Page};
use crate::error::{Result, SyncError};
use fs2::FileExt;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ReindexOptions {
    pub page_size: usize,
    /// Checked between pages; a set flag stops the rebuild after the current page
    pub cancel: Option<Arc<AtomicBool>>,
    /// Stop after this many pages in this run (the checkpoint allows resuming)
    pub max_pages: Option<usize>,
    pub checkpoint: Option<PathBuf>,
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cancel: None,
            max_pages: None,
            checkpoint: None,
        }
    }
}

impl ReindexOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Position of an interrupted rebuild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexCheckpoint {
    pub index_id: String,
    /// Next segment to enumerate
    pub segment: usize,
    /// Last entity id done within `segment`
    pub after: Option<u64>,
    /// Object ids already produced; survivors of the final stale sweep
    pub seen: BTreeSet<String>,
}

impl ReindexCheckpoint {
    pub fn new(index_id: impl Into<String>) -> Self {
        Self {
            index_id: index_id.into(),
            segment: 0,
            after: None,
            seen: BTreeSet::new(),
        }
    }

    /// Save the checkpoint with an exclusive lock
    pub fn save(&self, path: &Path) -> Result<()> {
        let err = |message: String| SyncError::Checkpoint {
            path: path.to_path_buf(),
            message,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| err(format!("failed to create directory: {}", e)))?;
        }

        let file = std::fs::File::create(path).map_err(|e| err(format!("failed to create: {}", e)))?;
        file.lock_exclusive()
            .map_err(|e| err(format!("failed to acquire exclusive lock: {}", e)))?;

        let writer = std::io::BufWriter::new(&file);
        bincode::serialize_into(writer, self).map_err(|e| err(format!("failed to serialize: {}", e)))?;
        Ok(())
    }

    /// Load a checkpoint with a shared lock
    pub fn load(path: &Path) -> Result<Self> {
        let err = |message: String| SyncError::Checkpoint {
            path: path.to_path_buf(),
            message,
        };

        let file = std::fs::File::open(path).map_err(|e| err(format!("failed to open: {}", e)))?;
        file.lock_shared()
            .map_err(|e| err(format!("failed to acquire shared lock: {}", e)))?;

        let reader = std::io::BufReader::new(&file);
        bincode::deserialize_from(reader).map_err(|e| err(format!("failed to deserialize: {}", e)))
    }

    /// Load a checkpoint for `index_id`, or `None` when absent, unreadable or
    /// written for another index.
    pub fn try_load(path: &Path, index_id: &str) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match Self::load(path) {
            Ok(cp) if cp.index_id == index_id => Some(cp),
            Ok(cp) => {
                warn!(
                    path = %path.display(),
                    found = %cp.index_id,
                    expected = %index_id,
                    "Checkpoint belongs to another index; starting over"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable checkpoint");
                None
            }
        }
    }
}

/// Reported after every page
#[derive(Debug, Clone, Serialize)]
pub struct ReindexProgress {
    pub index_id: String,
    pub segment: usize,
    pub segments: usize,
    /// Pages done in this run
    pub pages: usize,
    pub records_seen: usize,
    pub upserted: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReindexReport {
    pub index_id: String,
    pub pages: usize,
    pub records_seen: usize,
    pub upserted: usize,
    pub deleted: usize,
    pub failed: Vec<FailedOperation>,
    pub remote_calls: usize,
    /// False when cancelled or stopped by `max_pages`
    pub completed: bool,
    pub resumed: bool,
    pub checkpoint: Option<PathBuf>,
    pub elapsed_ms: u64,
}

/// Differences between local content and the remote index
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftReport {
    pub index_id: String,
    /// Indexable locally, absent remotely
    pub missing: Vec<String>,
    /// Present remotely, not (or no longer) indexable locally
    pub stale: Vec<String>,
    /// Present on both sides with different content
    pub outdated: Vec<String>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.stale.is_empty() && self.outdated.is_empty()
    }

    pub fn into_error(self, index_name: &str) -> SyncError {
        SyncError::DriftDetected {
            index: index_name.to_string(),
            missing: self.missing,
            stale: self.stale,
            outdated: self.outdated,
        }
    }
}

impl SearchIndex {
    pub fn reindex_all(&self, store: &dyn ContentStore) -> Result<ReindexReport> {
        self.reindex_with(store, &ReindexOptions::default(), |_| {})
    }

    /// Rebuild the remote index from `store`.
    ///
    /// Records whose fingerprint matches the remote copy are not resent.
    /// Remote records that were not produced by the enumeration are deleted,
    /// but only once the enumeration has run to the end.
    pub fn reindex_with<F>(
        &self,
        store: &dyn ContentStore,
        options: &ReindexOptions,
        mut on_page: F,
    ) -> Result<ReindexReport>
    where
        F: FnMut(&ReindexProgress),
    {
        let start = Instant::now();
        let name = self.remote_name();
        let mut remote = self.remote_fingerprints()?;

        let resumed_from = options
            .checkpoint
            .as_deref()
            .and_then(|path| ReindexCheckpoint::try_load(path, self.id()));
        let resumed = resumed_from.is_some();
        let mut cp = resumed_from.unwrap_or_else(|| ReindexCheckpoint::new(self.id()));
        // Produced by an earlier run; the store may have changed since
        let carried: Vec<String> = cp.seen.iter().cloned().collect();

        info!(
            index = %name,
            remote_records = remote.len(),
            resumed,
            segment = cp.segment,
            after = ?cp.after,
            "Reindex started"
        );

        let segments = self.indexable().segments();
        let page_size = options.page_size.max(1);
        let mut report = BatchReport::default();
        let mut pages = 0usize;
        let mut completed = true;

        while cp.segment < segments {
            if options.is_cancelled() || options.max_pages.is_some_and(|max| pages >= max) {
                completed = false;
                break;
            }

            let page = match cp.after {
                Some(last) => Page::after(last, page_size),
                None => Page::first(page_size),
            };
            let entities = self.indexable().fetch_page(store, cp.segment, page)?;
            let Some(last) = entities.last().map(|e| e.entity_ref().id) else {
                cp.segment += 1;
                cp.after = None;
                continue;
            };

            let decisions = self.decide_all(&entities)?;
            let mut operations = Vec::new();
            for (entity, decision) in entities.iter().zip(decisions) {
                match decision {
                    Decision::Skip => {}
                    Decision::Delete => {
                        let object_id = entity.entity_ref().object_id();
                        if remote.remove(&object_id).is_some() {
                            operations.push(SyncOperation::delete(object_id));
                        }
                    }
                    Decision::Upsert(record) => {
                        cp.seen.insert(record.object_id.clone());
                        let unchanged = remote
                            .get(&record.object_id)
                            .is_some_and(|fp| *fp == record.fingerprint());
                        if !unchanged {
                            operations.push(SyncOperation::upsert(record));
                        }
                    }
                }
            }

            if !operations.is_empty() {
                report.merge(self.apply(operations)?);
            }

            let fetched = entities.len();
            cp.after = Some(last);
            pages += 1;
            if fetched < page_size {
                cp.segment += 1;
                cp.after = None;
            }

            if let Some(path) = &options.checkpoint {
                cp.save(path)?;
            }

            debug!(index = %name, segment = cp.segment, after = ?cp.after, fetched, "Reindex page done");
            on_page(&ReindexProgress {
                index_id: self.id().to_string(),
                segment: cp.segment,
                segments,
                pages,
                records_seen: cp.seen.len(),
                upserted: report.upserted.len(),
                deleted: report.deleted.len(),
            });
        }

        if completed {
            let revalidated = self.revalidate(store, &carried, &mut cp.seen, &remote)?;
            if !revalidated.is_empty() {
                report.merge(self.apply(revalidated)?);
            }

            let stale: Vec<SyncOperation> = remote
                .keys()
                .filter(|id| !cp.seen.contains(*id))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|id| SyncOperation::delete(id.clone()))
                .collect();
            if !stale.is_empty() {
                info!(index = %name, stale = stale.len(), "Deleting stale records");
                report.merge(self.apply(stale)?);
            }
            if let Some(path) = &options.checkpoint {
                if path.exists() {
                    std::fs::remove_file(path).map_err(|e| SyncError::Checkpoint {
                        path: path.clone(),
                        message: format!("failed to remove: {}", e),
                    })?;
                }
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            index = %name,
            pages,
            upserted = report.upserted.len(),
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            completed,
            elapsed_ms,
            "Reindex finished"
        );

        Ok(ReindexReport {
            index_id: self.id().to_string(),
            pages,
            records_seen: cp.seen.len(),
            upserted: report.upserted.len(),
            deleted: report.deleted.len(),
            failed: report.failed,
            remote_calls: report.remote_calls,
            completed,
            resumed,
            checkpoint: if completed { None } else { options.checkpoint.clone() },
            elapsed_ms,
        })
    }

    /// Compare local content with the remote index without writing anything.
    pub fn check_drift(&self, store: &dyn ContentStore, page_size: usize) -> Result<DriftReport> {
        let mut remote = self.remote_fingerprints()?;
        let page_size = page_size.max(1);
        let mut drift = DriftReport {
            index_id: self.id().to_string(),
            ..Default::default()
        };

        for segment in 0..self.indexable().segments() {
            let mut page = Page::first(page_size);
            loop {
                let entities = self.indexable().fetch_page(store, segment, page)?;
                for decision in self.decide_all(&entities)? {
                    if let Decision::Upsert(record) = decision {
                        match remote.remove(&record.object_id) {
                            None => drift.missing.push(record.object_id),
                            Some(fp) if fp != record.fingerprint() => {
                                drift.outdated.push(record.object_id)
                            }
                            Some(_) => {}
                        }
                    }
                }
                match entities.last() {
                    Some(last) if entities.len() == page_size => {
                        page = Page::after(last.entity_ref().id, page_size);
                    }
                    _ => break,
                }
            }
        }

        drift.stale = remote.into_keys().collect();
        drift.missing.sort();
        drift.stale.sort();
        drift.outdated.sort();

        if !drift.is_clean() {
            warn!(
                index = %self.remote_name(),
                missing = drift.missing.len(),
                stale = drift.stale.len(),
                outdated = drift.outdated.len(),
                "Index drift detected"
            );
        }
        Ok(drift)
    }

    /// `DriftDetected` unless the remote index matches local content exactly.
    pub fn ensure_consistent(&self, store: &dyn ContentStore) -> Result<()> {
        let drift = self.check_drift(store, DEFAULT_PAGE_SIZE)?;
        if drift.is_clean() {
            Ok(())
        } else {
            Err(drift.into_error(&self.remote_name()))
        }
    }

    /// Re-decide ids produced by an earlier run. Ids that are no longer
    /// indexable leave `seen`, so the stale sweep removes them; changed ones
    /// are upserted again.
    fn revalidate(
        &self,
        store: &dyn ContentStore,
        carried: &[String],
        seen: &mut BTreeSet<String>,
        remote: &FxHashMap<String, String>,
    ) -> Result<Vec<SyncOperation>> {
        let mut operations = Vec::new();
        for object_id in carried {
            let entity = match EntityRef::from_object_id(object_id) {
                Some(entity_ref) => store.entity(entity_ref)?,
                None => None,
            };
            let decision = match &entity {
                Some(entity) => self.indexable().decide(entity)?,
                None => Decision::Skip,
            };
            match decision {
                Decision::Upsert(record) => {
                    if remote.get(object_id) != Some(&record.fingerprint()) {
                        operations.push(SyncOperation::upsert(record));
                    }
                }
                Decision::Skip | Decision::Delete => {
                    debug!(index = %self.id(), object_id = %object_id, "Resumed record no longer indexable");
                    seen.remove(object_id);
                }
            }
        }
        Ok(operations)
    }

    fn remote_fingerprints(&self) -> Result<FxHashMap<String, String>> {
        let client = self.require_client()?;
        let records = client
            .browse(&self.remote_name())
            .map_err(|e| self.remote_unavailable(e))?;
        Ok(records
            .par_iter()
            .map(|r| (r.object_id.clone(), r.fingerprint()))
            .collect())
    }

    fn decide_all(&self, entities: &[Entity]) -> Result<Vec<Decision>> {
        entities
            .par_iter()
            .map(|e| self.indexable().decide(e))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemorySearchClient, SearchClient};
    use crate::content::{MemoryContentStore, User};
    use crate::index::Record;
    use tempfile::TempDir;

    fn user(id: u64, posts_count: u64) -> Entity {
        Entity::User(User {
            id,
            login: format!("user{}", id),
            display_name: format!("User {}", id),
            description: String::new(),
            posts_count,
            posts_url: String::new(),
            avatar_url: String::new(),
        })
    }

    fn setup(users: &[(u64, u64)]) -> (MemoryContentStore, Arc<MemorySearchClient>, SearchIndex) {
        let store = MemoryContentStore::new();
        for (id, count) in users {
            store.put(user(*id, *count)).unwrap();
        }
        let client = Arc::new(MemorySearchClient::new());
        let mut index = SearchIndex::users();
        index.set_name_prefix("wp_");
        index.set_client(Some(client.clone() as Arc<dyn SearchClient>));
        (store, client, index)
    }

    #[test]
    fn test_reindex_reaches_fixed_point() {
        let (store, client, index) = setup(&[(1, 3), (2, 0), (3, 1)]);
        client.seed("wp_users", vec![Record::new("user_99"), Record::new("user_2")]);

        let first = index.reindex_all(&store).unwrap();
        assert!(first.completed);
        assert_eq!(first.upserted, 2);
        assert_eq!(first.deleted, 2);
        assert_eq!(client.object_ids("wp_users"), vec!["user_1", "user_3"]);

        client.clear_calls();
        let second = index.reindex_all(&store).unwrap();
        assert_eq!(second.upserted + second.deleted, 0);
        assert_eq!(client.write_calls(), 0);
    }

    #[test]
    fn test_cancelled_reindex_keeps_stale_records() {
        let (store, client, index) = setup(&[(1, 1), (2, 1)]);
        client.seed("wp_users", vec![Record::new("user_99")]);

        let cancel = Arc::new(AtomicBool::new(true));
        let options = ReindexOptions {
            cancel: Some(cancel),
            ..Default::default()
        };
        let report = index.reindex_with(&store, &options, |_| {}).unwrap();
        assert!(!report.completed);
        assert_eq!(client.object_ids("wp_users"), vec!["user_99"]);
    }

    #[test]
    fn test_reindex_resumes_from_checkpoint() {
        let (store, client, index) = setup(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)]);
        client.seed("wp_users", vec![Record::new("user_99")]);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.ckpt");

        let options = ReindexOptions {
            page_size: 2,
            max_pages: Some(1),
            checkpoint: Some(path.clone()),
            ..Default::default()
        };
        let first = index.reindex_with(&store, &options, |_| {}).unwrap();
        assert!(!first.completed);
        assert_eq!(first.upserted, 2);
        let cp = ReindexCheckpoint::load(&path).unwrap();
        assert_eq!((cp.segment, cp.after, cp.seen.len()), (0, Some(2), 2));

        let options = ReindexOptions {
            page_size: 2,
            checkpoint: Some(path.clone()),
            ..Default::default()
        };
        let mut progress = Vec::new();
        let second = index
            .reindex_with(&store, &options, |p| progress.push(p.pages))
            .unwrap();
        assert!(second.completed && second.resumed);
        assert_eq!(second.upserted, 3);
        assert_eq!(second.deleted, 1);
        assert_eq!(second.records_seen, 5);
        assert!(!progress.is_empty());
        assert!(!path.exists());
        assert_eq!(client.object_ids("wp_users").len(), 5);
    }

    #[test]
    fn test_resume_after_store_changed() {
        let (store, client, index) = setup(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1)]);
        client.seed(
            "wp_users",
            (1..=5).map(|i| Record::new(format!("user_{}", i))).collect(),
        );
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users.ckpt");

        let first = index
            .reindex_with(
                &store,
                &ReindexOptions {
                    page_size: 2,
                    max_pages: Some(1),
                    checkpoint: Some(path.clone()),
                    ..Default::default()
                },
                |_| {},
            )
            .unwrap();
        assert!(!first.completed);

        // user_1 was done by the first run, then removed; user_2 lost its posts
        store.remove(EntityRef::user(1)).unwrap();
        store.put(user(2, 0)).unwrap();

        let second = index
            .reindex_with(
                &store,
                &ReindexOptions {
                    page_size: 2,
                    checkpoint: Some(path.clone()),
                    ..Default::default()
                },
                |_| {},
            )
            .unwrap();

        assert!(second.completed && second.resumed);
        assert_eq!(
            client.object_ids("wp_users"),
            vec!["user_3", "user_4", "user_5"]
        );
        assert!(index.ensure_consistent(&store).is_ok());
    }

    #[test]
    fn test_checkpoint_for_other_index_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.bin");
        ReindexCheckpoint::new("posts_post").save(&path).unwrap();
        assert!(ReindexCheckpoint::try_load(&path, "users").is_none());
        assert!(ReindexCheckpoint::try_load(&path, "posts_post").is_some());
    }

    #[test]
    fn test_drift_detection() {
        let (store, client, index) = setup(&[(1, 1), (2, 1), (3, 0)]);
        client.seed(
            "wp_users",
            vec![Record::new("user_2").with("display_name", "old"), Record::new("user_3")],
        );

        let drift = index.check_drift(&store, 10).unwrap();
        assert_eq!(drift.missing, vec!["user_1"]);
        assert_eq!(drift.outdated, vec!["user_2"]);
        assert_eq!(drift.stale, vec!["user_3"]);
        assert_eq!(client.write_calls(), 0);

        let err = index.ensure_consistent(&store).unwrap_err();
        assert!(matches!(err, SyncError::DriftDetected { .. }));

        index.reindex_all(&store).unwrap();
        assert!(index.ensure_consistent(&store).is_ok());
    }

    #[test]
    fn test_unreachable_remote_fails_reindex() {
        let (store, client, index) = setup(&[(1, 1)]);
        client.set_unavailable(true);
        assert!(matches!(
            index.reindex_all(&store),
            Err(SyncError::RemoteUnavailable { .. })
        ));
    }
}
