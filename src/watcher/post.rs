use super::{ChangeAction, ChangesWatcher, ContentEvent, WatcherCore};
use crate::content::EntityKind;
use crate::error::{Result, SyncError};
use crate::index::SyncOperation;
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Keeps a posts index in step with post lifecycle events
pub struct PostChangesWatcher {
    core: WatcherCore,
    watched_meta: GlobSet,
}

impl PostChangesWatcher {
    /// `watched_meta_keys` are glob patterns; only meta updates matching one
    /// of them trigger a resync.
    pub fn new(core: WatcherCore, watched_meta_keys: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for key in watched_meta_keys {
            let glob = Glob::new(key).map_err(|e| {
                SyncError::Configuration(format!("invalid watched meta key `{}`: {}", key, e))
            })?;
            builder.add(glob);
        }
        let watched_meta = builder
            .build()
            .map_err(|e| SyncError::Configuration(format!("invalid watched meta keys: {}", e)))?;
        Ok(Self { core, watched_meta })
    }
}

impl ChangesWatcher for PostChangesWatcher {
    fn core(&self) -> &WatcherCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "posts"
    }

    fn plan(&self, event: &ContentEvent) -> Result<Vec<SyncOperation>> {
        if event.target.kind != EntityKind::Post {
            return Ok(Vec::new());
        }
        let op = match &event.action {
            ChangeAction::Deleted => self.core.plan_delete(event.target, event.before.as_ref()),
            ChangeAction::MetaUpdated { key } if !self.watched_meta.is_match(key) => None,
            _ => self.core.plan_change(event.target, event.before.as_ref())?,
        };
        Ok(op.into_iter().collect())
    }
}
