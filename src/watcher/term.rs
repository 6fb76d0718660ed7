use super::{ChangeAction, ChangesWatcher, ContentEvent, WatcherCore};
use crate::content::{EntityKind, EntityRef};
use crate::error::Result;
use crate::index::SyncOperation;
use std::collections::BTreeSet;

/// Keeps a terms index in step with term events, and with the post events
/// that move term counts.
pub struct TermChangesWatcher {
    core: WatcherCore,
}

impl TermChangesWatcher {
    pub fn new(core: WatcherCore) -> Self {
        Self { core }
    }

    /// Terms whose count may have moved because of a post event
    fn affected_terms(&self, event: &ContentEvent) -> Result<BTreeSet<EntityRef>> {
        let mut ids = BTreeSet::new();
        match &event.action {
            ChangeAction::StatusChanged { .. } | ChangeAction::Deleted => {
                ids.extend(event.snapshot_posts().flat_map(|p| p.term_ids()));
                if event.action != ChangeAction::Deleted {
                    if let Some(post) = self.core.store().post(event.target.id)? {
                        ids.extend(post.term_ids());
                    }
                }
            }
            ChangeAction::TermsAssigned { taxonomy, term_ids } => {
                ids.extend(term_ids.iter().copied());
                // Terms removed by the assignment lose a post too
                for post in event.snapshot_posts() {
                    if let Some(terms) = post.terms.get(taxonomy) {
                        ids.extend(terms.iter().map(|t| t.id));
                    }
                }
            }
            _ => {}
        }
        Ok(ids.into_iter().map(EntityRef::term).collect())
    }
}

impl ChangesWatcher for TermChangesWatcher {
    fn core(&self) -> &WatcherCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "terms"
    }

    fn plan(&self, event: &ContentEvent) -> Result<Vec<SyncOperation>> {
        match event.target.kind {
            EntityKind::Term => Ok(match event.action {
                ChangeAction::Deleted => self
                    .core
                    .plan_delete(event.target, event.before.as_ref())
                    .into_iter()
                    .collect(),
                _ => self.core.plan_resync(event.target)?.into_iter().collect(),
            }),
            EntityKind::Post => {
                let terms = self.affected_terms(event)?;
                // A term that vanished meanwhile is none of our business here
                let mut operations = Vec::new();
                for term in terms {
                    if let Some(entity) = self.core.store().entity(term)? {
                        operations.extend(self.core.index().plan_entity(&entity)?);
                    }
                }
                Ok(operations)
            }
            EntityKind::User => Ok(Vec::new()),
        }
    }
}
