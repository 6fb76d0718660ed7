//! In-memory content store backed by a JSON snapshot.
//!
//! Used by the command-line host (which reads an export of the CMS content)
//! and by tests, which mutate it to simulate content changes.

use super::{ContentStore, Entity, Page, Post, PostType, Taxonomy, Term, User};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Serialized form of a content export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentSnapshot {
    #[serde(default)]
    pub post_types: Vec<PostType>,
    #[serde(default)]
    pub taxonomies: Vec<Taxonomy>,
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub terms: Vec<Term>,
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Default)]
struct Contents {
    post_types: Vec<PostType>,
    taxonomies: Vec<Taxonomy>,
    posts: BTreeMap<u64, Post>,
    terms: BTreeMap<u64, Term>,
    users: BTreeMap<u64, User>,
}

#[derive(Default)]
pub struct MemoryContentStore {
    contents: RwLock<Contents>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: ContentSnapshot) -> Self {
        let contents = Contents {
            post_types: snapshot.post_types,
            taxonomies: snapshot.taxonomies,
            posts: snapshot.posts.into_iter().map(|p| (p.id, p)).collect(),
            terms: snapshot.terms.into_iter().map(|t| (t.id, t)).collect(),
            users: snapshot.users.into_iter().map(|u| (u.id, u)).collect(),
        };
        Self {
            contents: RwLock::new(contents),
        }
    }

    /// Load a snapshot exported as JSON
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let snapshot: ContentSnapshot = serde_json::from_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            posts = snapshot.posts.len(),
            terms = snapshot.terms.len(),
            users = snapshot.users.len(),
            "Loaded content snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn snapshot(&self) -> Result<ContentSnapshot> {
        let c = self.read()?;
        Ok(ContentSnapshot {
            post_types: c.post_types.clone(),
            taxonomies: c.taxonomies.clone(),
            posts: c.posts.values().cloned().collect(),
            terms: c.terms.values().cloned().collect(),
            users: c.users.values().cloned().collect(),
        })
    }

    pub fn register_post_type(&self, post_type: PostType) -> Result<()> {
        let mut c = self.write()?;
        c.post_types.retain(|p| p.name != post_type.name);
        c.post_types.push(post_type);
        Ok(())
    }

    pub fn register_taxonomy(&self, taxonomy: Taxonomy) -> Result<()> {
        let mut c = self.write()?;
        c.taxonomies.retain(|t| t.name != taxonomy.name);
        c.taxonomies.push(taxonomy);
        Ok(())
    }

    /// Insert or replace an entity
    pub fn put(&self, entity: Entity) -> Result<()> {
        let mut c = self.write()?;
        match entity {
            Entity::Post(p) => {
                c.posts.insert(p.id, p);
            }
            Entity::Term(t) => {
                c.terms.insert(t.id, t);
            }
            Entity::User(u) => {
                c.users.insert(u.id, u);
            }
        }
        Ok(())
    }

    /// Remove an entity, returning its last state
    pub fn remove(&self, entity: super::EntityRef) -> Result<Option<Entity>> {
        let mut c = self.write()?;
        Ok(match entity.kind {
            super::EntityKind::Post => c.posts.remove(&entity.id).map(Entity::Post),
            super::EntityKind::Term => c.terms.remove(&entity.id).map(Entity::Term),
            super::EntityKind::User => c.users.remove(&entity.id).map(Entity::User),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Contents>> {
        self.contents
            .read()
            .map_err(|e| SyncError::ContentStore(format!("content lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Contents>> {
        self.contents
            .write()
            .map_err(|e| SyncError::ContentStore(format!("content lock poisoned: {}", e)))
    }
}

impl ContentStore for MemoryContentStore {
    fn post(&self, id: u64) -> Result<Option<Post>> {
        Ok(self.read()?.posts.get(&id).cloned())
    }

    fn term(&self, id: u64) -> Result<Option<Term>> {
        Ok(self.read()?.terms.get(&id).cloned())
    }

    fn user(&self, id: u64) -> Result<Option<User>> {
        Ok(self.read()?.users.get(&id).cloned())
    }

    fn post_types(&self) -> Result<Vec<PostType>> {
        Ok(self.read()?.post_types.clone())
    }

    fn taxonomies(&self) -> Result<Vec<Taxonomy>> {
        Ok(self.read()?.taxonomies.clone())
    }

    fn posts_page(&self, post_types: &[String], page: Page) -> Result<Vec<Post>> {
        Ok(self
            .read()?
            .posts
            .values()
            .filter(|p| page.admits(p.id) && post_types.iter().any(|t| *t == p.post_type))
            .take(page.size)
            .cloned()
            .collect())
    }

    fn terms_page(&self, taxonomy: &str, page: Page) -> Result<Vec<Term>> {
        Ok(self
            .read()?
            .terms
            .values()
            .filter(|t| page.admits(t.id) && t.taxonomy == taxonomy)
            .take(page.size)
            .cloned()
            .collect())
    }

    fn users_page(&self, page: Page) -> Result<Vec<User>> {
        Ok(self
            .read()?
            .users
            .values()
            .filter(|u| page.admits(u.id))
            .take(page.size)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::EntityRef;

    fn post(id: u64, post_type: &str) -> Post {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "post_type": post_type,
            "title": format!("Post {}", id),
        }))
        .unwrap()
    }

    #[test]
    fn test_posts_page_filters_and_orders() {
        let store = MemoryContentStore::new();
        for id in [5, 1, 3, 2, 4] {
            store.put(Entity::Post(post(id, "post"))).unwrap();
        }
        store.put(Entity::Post(post(6, "page"))).unwrap();

        let types = vec!["post".to_string()];
        let first: Vec<u64> = store
            .posts_page(&types, Page::first(2))
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        let last: Vec<u64> = store
            .posts_page(&types, Page::after(4, 2))
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();

        assert_eq!(first, vec![1, 2]);
        assert_eq!(last, vec![5]);
        assert!(store.posts_page(&types, Page::after(5, 2)).unwrap().is_empty());
    }

    #[test]
    fn test_remove_then_lookup_is_none() {
        let store = MemoryContentStore::new();
        store.put(Entity::Post(post(42, "post"))).unwrap();
        let removed = store.remove(EntityRef::post(42)).unwrap();
        assert!(removed.is_some());
        assert!(store.entity(EntityRef::post(42)).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("content.json");
        std::fs::write(
            &path,
            r#"{
                "post_types": [{"name": "post", "label": "Posts"}],
                "users": [{"id": 1, "display_name": "Ada", "posts_count": 3}]
            }"#,
        )
        .unwrap();

        let store = MemoryContentStore::from_file(&path).unwrap();
        assert_eq!(store.post_types().unwrap().len(), 1);
        assert_eq!(store.user(1).unwrap().unwrap().display_name, "Ada");
        assert!(store.taxonomies().unwrap().is_empty());
    }
}
