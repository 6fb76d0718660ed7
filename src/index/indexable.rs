//! Indexable adapters: per content kind, decide what is indexed and how an
//! entity is projected into a [`Record`].

use super::Record;
use crate::content::{
    ContentStore, Entity, EntityKind, EntityRef, Page, Post, PostType, Term, User,
};
use crate::error::{Result, SyncError};
use crate::utils::{format_timestamp, strip_tags, trim_words, EXCERPT_WORDS};
use serde_json::Value;
use std::collections::HashMap;

/// What should happen to an entity in a given index
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The entity does not belong to this index at all
    Skip,
    /// The entity belongs here but must not be searchable (e.g. a draft)
    Delete,
    Upsert(Record),
}

pub trait Indexable: Send + Sync {
    /// Entity kinds this adapter produces records for
    fn kinds(&self) -> Vec<EntityKind>;

    /// Whether the entity belongs to this index (right kind, post type, taxonomy)
    fn accepts(&self, entity: &Entity) -> bool;

    /// Kind-specific publication policy. Only meaningful for accepted entities.
    fn is_indexable(&self, entity: &Entity) -> bool;

    fn to_record(&self, entity: &Entity) -> Result<Record>;

    /// Number of independent enumerations making up the full entity set
    fn segments(&self) -> usize {
        1
    }

    /// One page of candidate entities, ordered by id
    fn fetch_page(&self, store: &dyn ContentStore, segment: usize, page: Page)
        -> Result<Vec<Entity>>;

    fn decide(&self, entity: &Entity) -> Result<Decision> {
        if !self.accepts(entity) {
            return Ok(Decision::Skip);
        }
        if !self.is_indexable(entity) {
            return Ok(Decision::Delete);
        }
        Ok(Decision::Upsert(self.to_record(entity)?))
    }
}

fn wrong_kind(adapter: &str, entity: &Entity) -> SyncError {
    SyncError::Configuration(format!(
        "{} adapter cannot build a record for {}",
        adapter,
        entity.entity_ref()
    ))
}

/// Posts of one or more post types
pub struct PostsIndexable {
    post_types: Vec<String>,
    labels: HashMap<String, String>,
}

impl PostsIndexable {
    pub fn new(post_types: &[PostType]) -> Self {
        Self {
            post_types: post_types.iter().map(|p| p.name.clone()).collect(),
            labels: post_types
                .iter()
                .map(|p| (p.name.clone(), p.label.clone()))
                .collect(),
        }
    }

    pub fn post_types(&self) -> &[String] {
        &self.post_types
    }

    fn post_record(&self, post: &Post) -> Record {
        let content = strip_tags(&post.content);
        let excerpt = if post.excerpt.trim().is_empty() {
            trim_words(&content, EXCERPT_WORDS)
        } else {
            strip_tags(&post.excerpt)
        };
        let label = self
            .labels
            .get(&post.post_type)
            .filter(|l| !l.is_empty())
            .cloned()
            .unwrap_or_else(|| post.post_type.clone());

        let mut record = Record::new(EntityRef::post(post.id).object_id())
            .with("post_id", post.id)
            .with("post_type", post.post_type.as_str())
            .with("post_type_label", label)
            .with("post_title", post.title.as_str())
            .with("post_excerpt", excerpt)
            .with("content", content)
            .with("post_date", post.date)
            .with("post_date_formatted", format_timestamp(post.date))
            .with("post_modified", post.modified)
            .with("comment_count", post.comment_count)
            .with("menu_order", post.menu_order)
            .with("permalink", post.permalink.as_str())
            .with("is_sticky", post.sticky);

        if let Some(author_id) = post.author_id {
            record.set("post_author_id", author_id);
            record.set("post_author_name", post.author_name.as_str());
        }

        for (taxonomy, terms) in &post.terms {
            let names: Vec<Value> = terms.iter().map(|t| Value::from(t.name.as_str())).collect();
            record.set(&format!("taxonomy_{}", taxonomy), names);
        }

        record
    }
}

impl Indexable for PostsIndexable {
    fn kinds(&self) -> Vec<EntityKind> {
        vec![EntityKind::Post]
    }

    fn accepts(&self, entity: &Entity) -> bool {
        match entity {
            Entity::Post(post) => {
                !post.is_revision() && self.post_types.iter().any(|t| *t == post.post_type)
            }
            _ => false,
        }
    }

    fn is_indexable(&self, entity: &Entity) -> bool {
        match entity {
            Entity::Post(post) => post.is_published() && !post.has_password,
            _ => false,
        }
    }

    fn to_record(&self, entity: &Entity) -> Result<Record> {
        match entity {
            Entity::Post(post) => Ok(self.post_record(post)),
            other => Err(wrong_kind("posts", other)),
        }
    }

    fn fetch_page(
        &self,
        store: &dyn ContentStore,
        _segment: usize,
        page: Page,
    ) -> Result<Vec<Entity>> {
        Ok(store
            .posts_page(&self.post_types, page)?
            .into_iter()
            .map(Entity::Post)
            .collect())
    }
}

/// Terms of one taxonomy
pub struct TermsIndexable {
    taxonomy: String,
}

impl TermsIndexable {
    pub fn new(taxonomy: impl Into<String>) -> Self {
        Self {
            taxonomy: taxonomy.into(),
        }
    }

    fn term_record(term: &Term) -> Record {
        Record::new(EntityRef::term(term.id).object_id())
            .with("term_id", term.id)
            .with("taxonomy", term.taxonomy.as_str())
            .with("name", term.name.as_str())
            .with("slug", term.slug.as_str())
            .with("description", strip_tags(&term.description))
            .with("posts_count", term.count)
            .with("permalink", term.permalink.as_str())
    }
}

impl Indexable for TermsIndexable {
    fn kinds(&self) -> Vec<EntityKind> {
        vec![EntityKind::Term]
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Term(term) if term.taxonomy == self.taxonomy)
    }

    /// Empty terms lead nowhere; only terms in use are searchable
    fn is_indexable(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::Term(term) if term.count > 0)
    }

    fn to_record(&self, entity: &Entity) -> Result<Record> {
        match entity {
            Entity::Term(term) => Ok(Self::term_record(term)),
            other => Err(wrong_kind("terms", other)),
        }
    }

    fn fetch_page(
        &self,
        store: &dyn ContentStore,
        _segment: usize,
        page: Page,
    ) -> Result<Vec<Entity>> {
        Ok(store
            .terms_page(&self.taxonomy, page)?
            .into_iter()
            .map(Entity::Term)
            .collect())
    }
}

/// Users who authored content
#[derive(Default)]
pub struct UsersIndexable;

impl UsersIndexable {
    fn user_record(user: &User) -> Record {
        Record::new(EntityRef::user(user.id).object_id())
            .with("user_id", user.id)
            .with("display_name", user.display_name.as_str())
            .with("description", strip_tags(&user.description))
            .with("posts_count", user.posts_count)
            .with("posts_url", user.posts_url.as_str())
            .with("avatar_url", user.avatar_url.as_str())
    }
}

impl Indexable for UsersIndexable {
    fn kinds(&self) -> Vec<EntityKind> {
        vec![EntityKind::User]
    }

    fn accepts(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::User(_))
    }

    fn is_indexable(&self, entity: &Entity) -> bool {
        matches!(entity, Entity::User(user) if user.posts_count > 0)
    }

    fn to_record(&self, entity: &Entity) -> Result<Record> {
        match entity {
            Entity::User(user) => Ok(Self::user_record(user)),
            other => Err(wrong_kind("users", other)),
        }
    }

    fn fetch_page(
        &self,
        store: &dyn ContentStore,
        _segment: usize,
        page: Page,
    ) -> Result<Vec<Entity>> {
        Ok(store
            .users_page(page)?
            .into_iter()
            .map(Entity::User)
            .collect())
    }
}

/// Several adapters behind one index. The first child accepting an entity owns it.
pub struct CompositeIndexable {
    children: Vec<Box<dyn Indexable>>,
}

impl CompositeIndexable {
    pub fn new(children: Vec<Box<dyn Indexable>>) -> Self {
        Self { children }
    }

    fn owner(&self, entity: &Entity) -> Option<&dyn Indexable> {
        self.children
            .iter()
            .find(|c| c.accepts(entity))
            .map(|c| c.as_ref())
    }

    /// Map a composite segment onto (child, child segment)
    fn locate(&self, segment: usize) -> Option<(&dyn Indexable, usize)> {
        let mut remaining = segment;
        for child in &self.children {
            let n = child.segments();
            if remaining < n {
                return Some((child.as_ref(), remaining));
            }
            remaining -= n;
        }
        None
    }
}

impl Indexable for CompositeIndexable {
    fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<EntityKind> = self.children.iter().flat_map(|c| c.kinds()).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    fn accepts(&self, entity: &Entity) -> bool {
        self.owner(entity).is_some()
    }

    fn is_indexable(&self, entity: &Entity) -> bool {
        self.owner(entity).is_some_and(|c| c.is_indexable(entity))
    }

    fn to_record(&self, entity: &Entity) -> Result<Record> {
        match self.owner(entity) {
            Some(child) => child.to_record(entity),
            None => Err(wrong_kind("composite", entity)),
        }
    }

    fn segments(&self) -> usize {
        self.children.iter().map(|c| c.segments()).sum()
    }

    fn fetch_page(
        &self,
        store: &dyn ContentStore,
        segment: usize,
        page: Page,
    ) -> Result<Vec<Entity>> {
        match self.locate(segment) {
            Some((child, child_segment)) => child.fetch_page(store, child_segment, page),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::AssignedTerm;
    use std::collections::BTreeMap;

    fn post(id: u64, post_type: &str, status: &str) -> Post {
        Post {
            id,
            post_type: post_type.to_string(),
            status: status.to_string(),
            has_password: false,
            title: format!("Post {}", id),
            content: "<p>Some <em>rich</em> content</p>".to_string(),
            excerpt: String::new(),
            author_id: Some(7),
            author_name: "Ada".to_string(),
            date: 1_709_596_800,
            modified: 1_709_596_800,
            comment_count: 2,
            menu_order: 0,
            permalink: format!("https://example.com/?p={}", id),
            terms: BTreeMap::from([(
                "category".to_string(),
                vec![AssignedTerm {
                    id: 3,
                    name: "News".to_string(),
                }],
            )]),
            sticky: false,
            parent_id: None,
        }
    }

    fn post_types(names: &[&str]) -> Vec<PostType> {
        names
            .iter()
            .map(|n| PostType {
                name: n.to_string(),
                label: n.to_uppercase(),
                exclude_from_search: false,
            })
            .collect()
    }

    #[test]
    fn test_post_decisions() {
        let adapter = PostsIndexable::new(&post_types(&["post"]));

        let published = Entity::Post(post(42, "post", "publish"));
        let draft = Entity::Post(post(42, "post", "draft"));
        let page = Entity::Post(post(43, "page", "publish"));
        let mut protected = post(44, "post", "publish");
        protected.has_password = true;

        assert!(matches!(adapter.decide(&published).unwrap(), Decision::Upsert(r) if r.object_id == "post_42"));
        assert_eq!(adapter.decide(&draft).unwrap(), Decision::Delete);
        assert_eq!(adapter.decide(&page).unwrap(), Decision::Skip);
        assert_eq!(adapter.decide(&Entity::Post(protected)).unwrap(), Decision::Delete);
    }

    #[test]
    fn test_revisions_are_not_accepted() {
        let adapter = PostsIndexable::new(&post_types(&["post", "revision"]));
        assert!(!adapter.accepts(&Entity::Post(post(9, "revision", "inherit"))));
    }

    #[test]
    fn test_post_record_attributes() {
        let adapter = PostsIndexable::new(&post_types(&["post"]));
        let record = adapter.to_record(&Entity::Post(post(42, "post", "publish"))).unwrap();

        assert_eq!(record.object_id, "post_42");
        assert_eq!(record.get("post_type_label").unwrap(), "POST");
        assert_eq!(record.get("content").unwrap(), "Some rich content");
        assert_eq!(record.get("post_excerpt").unwrap(), "Some rich content");
        assert_eq!(record.get("post_author_id").unwrap(), 7);
        assert_eq!(record.get("taxonomy_category").unwrap(), &serde_json::json!(["News"]));
        assert_eq!(record.get("post_date_formatted").unwrap(), "March 5, 2024");
    }

    #[test]
    fn test_term_and_user_policies() {
        let terms = TermsIndexable::new("category");
        let used = Entity::Term(Term {
            id: 3,
            taxonomy: "category".into(),
            name: "News".into(),
            slug: "news".into(),
            description: String::new(),
            count: 4,
            permalink: String::new(),
        });
        let mut empty = used.clone();
        if let Entity::Term(t) = &mut empty {
            t.count = 0;
        }
        assert!(terms.is_indexable(&used));
        assert_eq!(terms.decide(&empty).unwrap(), Decision::Delete);

        let users = UsersIndexable;
        let lurker = Entity::User(User {
            id: 1,
            login: "lurker".into(),
            display_name: "Lurker".into(),
            description: String::new(),
            posts_count: 0,
            posts_url: String::new(),
            avatar_url: String::new(),
        });
        assert_eq!(users.decide(&lurker).unwrap(), Decision::Delete);
        assert!(users.to_record(&used).is_err());
    }

    #[test]
    fn test_composite_kinds_and_segments() {
        let composite = CompositeIndexable::new(vec![
            Box::new(PostsIndexable::new(&post_types(&["post"]))),
            Box::new(TermsIndexable::new("category")),
            Box::new(TermsIndexable::new("post_tag")),
        ]);
        assert_eq!(composite.kinds(), vec![EntityKind::Post, EntityKind::Term]);
        assert_eq!(composite.segments(), 3);
        assert!(composite.accepts(&Entity::Post(post(1, "post", "publish"))));
        assert!(!composite.accepts(&Entity::Post(post(1, "page", "publish"))));
    }
}
