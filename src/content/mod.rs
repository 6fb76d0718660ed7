//! Content model and the content store boundary.
//!
//! Entities are owned by the host CMS. The sync core only reads them through
//! [`ContentStore`], either by identifier or page by page for a full rebuild.

pub mod memory;

pub use memory::{ContentSnapshot, MemoryContentStore};

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of content an index can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Post,
    Term,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Post, EntityKind::Term, EntityKind::User];

    /// Plural tag used in index filters ("posts", "terms", "users")
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Post => "posts",
            EntityKind::Term => "terms",
            EntityKind::User => "users",
        }
    }

    /// Prefix of the remote objectID
    pub fn object_prefix(&self) -> &'static str {
        match self {
            EntityKind::Post => "post",
            EntityKind::Term => "term",
            EntityKind::User => "user",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "post" | "posts" => Ok(EntityKind::Post),
            "term" | "terms" => Ok(EntityKind::Term),
            "user" | "users" => Ok(EntityKind::User),
            other => Err(SyncError::Configuration(format!(
                "unknown entity kind `{}` (expected posts, terms or users)",
                other
            ))),
        }
    }
}

/// Identity of an entity, independent of its current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn post(id: u64) -> Self {
        Self::new(EntityKind::Post, id)
    }

    pub fn term(id: u64) -> Self {
        Self::new(EntityKind::Term, id)
    }

    pub fn user(id: u64) -> Self {
        Self::new(EntityKind::User, id)
    }

    /// Stable remote key, e.g. `post_42`
    pub fn object_id(&self) -> String {
        format!("{}_{}", self.kind.object_prefix(), self.id)
    }

    /// Inverse of [`EntityRef::object_id`]
    pub fn from_object_id(object_id: &str) -> Option<Self> {
        let (prefix, id) = object_id.rsplit_once('_')?;
        let kind = EntityKind::ALL
            .into_iter()
            .find(|k| k.object_prefix() == prefix)?;
        Some(Self::new(kind, id.parse().ok()?))
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.object_prefix(), self.id)
    }
}

fn default_post_status() -> String {
    "publish".to_string()
}

/// A term assigned to a post, denormalized so records can be built without a lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTerm {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    pub post_type: String,
    #[serde(default = "default_post_status")]
    pub status: String,
    #[serde(default)]
    pub has_password: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub author_id: Option<u64>,
    #[serde(default)]
    pub author_name: String,
    /// Publication date, unix seconds
    #[serde(default)]
    pub date: i64,
    /// Last modification, unix seconds
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(default)]
    pub menu_order: i64,
    #[serde(default)]
    pub permalink: String,
    /// Assigned terms keyed by taxonomy
    #[serde(default)]
    pub terms: BTreeMap<String, Vec<AssignedTerm>>,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub parent_id: Option<u64>,
}

impl Post {
    pub fn is_published(&self) -> bool {
        self.status == "publish"
    }

    pub fn is_revision(&self) -> bool {
        self.post_type == "revision"
    }

    /// All term ids assigned to this post, across taxonomies
    pub fn term_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.terms.values().flatten().map(|t| t.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub id: u64,
    pub taxonomy: String,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: String,
    /// Number of published objects using this term
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub permalink: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    #[serde(default)]
    pub login: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub posts_count: u64,
    #[serde(default)]
    pub posts_url: String,
    #[serde(default)]
    pub avatar_url: String,
}

/// Native content unit observed by the sync core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Post(Post),
    Term(Term),
    User(User),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Post(_) => EntityKind::Post,
            Entity::Term(_) => EntityKind::Term,
            Entity::User(_) => EntityKind::User,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Entity::Post(p) => p.id,
            Entity::Term(t) => t.id,
            Entity::User(u) => u.id,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind(), self.id())
    }

    pub fn as_post(&self) -> Option<&Post> {
        match self {
            Entity::Post(p) => Some(p),
            _ => None,
        }
    }
}

/// A registered post type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostType {
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub exclude_from_search: bool,
}

/// A registered taxonomy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub name: String,
    #[serde(default)]
    pub label: String,
}

/// Keyset page of an id-ordered enumeration: at most `size` entities whose id
/// is greater than `after`. Entities added or removed below `after` do not
/// move the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub after: Option<u64>,
    pub size: usize,
}

impl Page {
    pub fn first(size: usize) -> Self {
        Self {
            after: None,
            size: size.max(1),
        }
    }

    pub fn after(last_id: u64, size: usize) -> Self {
        Self {
            after: Some(last_id),
            size: size.max(1),
        }
    }

    pub fn admits(&self, id: u64) -> bool {
        self.after.is_none_or(|after| id > after)
    }
}

/// Read access to the host's content.
///
/// Lookups return `Ok(None)` for entities that do not exist (anymore); that is
/// the terminal state of a record, not an error. Enumerations must be stable
/// (ordered by id) so a paged rebuild can resume.
pub trait ContentStore: Send + Sync {
    fn post(&self, id: u64) -> Result<Option<Post>>;
    fn term(&self, id: u64) -> Result<Option<Term>>;
    fn user(&self, id: u64) -> Result<Option<User>>;

    fn post_types(&self) -> Result<Vec<PostType>>;
    fn taxonomies(&self) -> Result<Vec<Taxonomy>>;

    fn posts_page(&self, post_types: &[String], page: Page) -> Result<Vec<Post>>;
    fn terms_page(&self, taxonomy: &str, page: Page) -> Result<Vec<Term>>;
    fn users_page(&self, page: Page) -> Result<Vec<User>>;

    fn entity(&self, entity: EntityRef) -> Result<Option<Entity>> {
        Ok(match entity.kind {
            EntityKind::Post => self.post(entity.id)?.map(Entity::Post),
            EntityKind::Term => self.term(entity.id)?.map(Entity::Term),
            EntityKind::User => self.user(entity.id)?.map(Entity::User),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_is_kind_and_id() {
        assert_eq!(EntityRef::post(42).object_id(), "post_42");
        assert_eq!(EntityRef::term(7).object_id(), "term_7");
        assert_eq!(EntityRef::user(3).object_id(), "user_3");
    }

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("posts".parse::<EntityKind>().unwrap(), EntityKind::Post);
        assert_eq!("Term".parse::<EntityKind>().unwrap(), EntityKind::Term);
        assert!("comments".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_entity_deserialize_tagged() {
        let json = r#"{"kind":"post","id":42,"post_type":"post","title":"Hello"}"#;
        let entity: Entity = serde_json::from_str(json).unwrap();
        assert_eq!(entity.entity_ref(), EntityRef::post(42));
        let post = entity.as_post().unwrap();
        assert!(post.is_published());
        assert!(!post.has_password);
    }

    #[test]
    fn test_page_keyset() {
        assert!(Page::first(10).admits(0));
        let page = Page::after(7, 0);
        assert_eq!(page.size, 1);
        assert!(!page.admits(7));
        assert!(page.admits(8));
    }

    #[test]
    fn test_object_id_round_trip() {
        assert_eq!(EntityRef::from_object_id("post_42"), Some(EntityRef::post(42)));
        assert_eq!(EntityRef::from_object_id("user_3"), Some(EntityRef::user(3)));
        assert_eq!(EntityRef::from_object_id("comment_3"), None);
        assert_eq!(EntityRef::from_object_id("term_x"), None);
    }
}
