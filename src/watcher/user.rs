use super::{ChangeAction, ChangesWatcher, ContentEvent, WatcherCore};
use crate::content::{EntityKind, EntityRef};
use crate::error::Result;
use crate::index::SyncOperation;
use std::collections::BTreeSet;

/// Keeps the users index in step with user events and with post events that
/// change an author's post count.
pub struct UserChangesWatcher {
    core: WatcherCore,
}

impl UserChangesWatcher {
    pub fn new(core: WatcherCore) -> Self {
        Self { core }
    }

    fn affected_authors(&self, event: &ContentEvent) -> Result<BTreeSet<EntityRef>> {
        if !matches!(
            event.action,
            ChangeAction::Created | ChangeAction::Deleted | ChangeAction::StatusChanged { .. }
        ) {
            return Ok(BTreeSet::new());
        }
        let mut authors: BTreeSet<u64> = BTreeSet::new();
        authors.extend(event.snapshot_posts().filter_map(|p| p.author_id));
        if event.action != ChangeAction::Deleted {
            if let Some(author) = self.core.store().post(event.target.id)?.and_then(|p| p.author_id) {
                authors.insert(author);
            }
        }
        Ok(authors.into_iter().map(EntityRef::user).collect())
    }
}

impl ChangesWatcher for UserChangesWatcher {
    fn core(&self) -> &WatcherCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        "users"
    }

    fn plan(&self, event: &ContentEvent) -> Result<Vec<SyncOperation>> {
        match event.target.kind {
            EntityKind::User => Ok(match event.action {
                ChangeAction::Deleted => self
                    .core
                    .plan_delete(event.target, event.before.as_ref())
                    .into_iter()
                    .collect(),
                _ => self.core.plan_resync(event.target)?.into_iter().collect(),
            }),
            EntityKind::Post => self.core.plan_resync_all(self.affected_authors(event)?),
            EntityKind::Term => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemorySearchClient, SearchClient};
    use crate::content::{ContentStore, Entity, MemoryContentStore};
    use crate::index::SearchIndex;
    use crate::watcher::test_support::{post, user};
    use crate::watcher::OperationSink;
    use std::sync::Arc;

    fn setup() -> (Arc<MemoryContentStore>, Arc<MemorySearchClient>, UserChangesWatcher) {
        let store = Arc::new(MemoryContentStore::new());
        let client = Arc::new(MemorySearchClient::new());
        let mut index = SearchIndex::users();
        index.set_name_prefix("wp_");
        index.set_client(Some(client.clone() as Arc<dyn SearchClient>));
        index.set_enabled(true);
        let core = WatcherCore::new(
            Arc::new(index),
            store.clone() as Arc<dyn ContentStore>,
            OperationSink::Immediate,
        );
        (store, client, UserChangesWatcher::new(core))
    }

    #[test]
    fn test_first_post_makes_author_searchable() {
        let (store, client, watcher) = setup();
        store.put(user(5, 1)).unwrap();
        store.put(Entity::Post(post(42, "publish"))).unwrap();

        let report = watcher.handle(&ContentEvent::created(EntityRef::post(42))).unwrap();
        assert_eq!(report.upserted, vec!["user_5"]);
        assert!(client.record("wp_users", "user_5").is_some());
    }

    #[test]
    fn test_post_update_does_not_touch_author() {
        let (store, client, watcher) = setup();
        store.put(user(5, 1)).unwrap();
        store.put(Entity::Post(post(42, "publish"))).unwrap();
        watcher.handle(&ContentEvent::updated(EntityRef::post(42))).unwrap();
        assert!(client.calls().is_empty());
    }

    #[test]
    fn test_deleted_user_is_removed() {
        let (_store, client, watcher) = setup();
        client.seed("wp_users", vec![crate::index::Record::new("user_5")]);
        watcher.handle(&ContentEvent::deleted(EntityRef::user(5))).unwrap();
        assert!(client.records("wp_users").is_empty());
    }

    #[test]
    fn test_missing_author_is_deleted() {
        let (_store, client, watcher) = setup();
        let event = ContentEvent::deleted(EntityRef::post(42)).with_before(Entity::Post(post(42, "publish")));
        let report = watcher.handle(&event).unwrap();
        assert_eq!(report.deleted, vec!["user_5"]);
        assert_eq!(client.write_calls(), 1);
    }
}
