//! Serializable projection of an entity, keyed by `objectID`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const USER_UNDERSCORE_ATTRIBUTES: [&str; 2] = ["_tags", "_geoloc"];

/// A flat mapping of attribute name to scalar/array value plus the remote key.
///
/// `attributes` is a sorted map, so the JSON form (and therefore the
/// fingerprint) is canonical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "objectID")]
    pub object_id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Record {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            attributes: Map::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Drop the `_highlightResult`-style attributes the search engine adds to
    /// read results. `_tags` and `_geoloc` are user data and stay.
    pub fn strip_engine_attributes(&mut self) {
        self.attributes
            .retain(|key, _| !key.starts_with('_') || USER_UNDERSCORE_ATTRIBUTES.contains(&key.as_str()));
    }

    /// md5 of the canonical JSON form. Two records with equal fingerprints
    /// produce the same remote state.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", md5::compute(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_engine_attributes_restores_fingerprint() {
        let record = Record::new("post_1")
            .with("post_title", "Hello")
            .with("_tags", vec!["news"]);
        let mut hit: Record = serde_json::from_value(serde_json::json!({
            "objectID": "post_1",
            "post_title": "Hello",
            "_tags": ["news"],
            "_highlightResult": {"post_title": {"value": "Hello"}},
            "_snippetResult": {}
        }))
        .unwrap();
        assert_ne!(hit.fingerprint(), record.fingerprint());

        hit.strip_engine_attributes();
        assert_eq!(hit, record);
        assert_eq!(hit.fingerprint(), record.fingerprint());
    }

    #[test]
    fn test_serializes_object_id_at_top_level() {
        let record = Record::new("post_42")
            .with("post_title", "Hello")
            .with("comment_count", 3);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["objectID"], "post_42");
        assert_eq!(json["post_title"], "Hello");
        assert_eq!(json["comment_count"], 3);
    }

    #[test]
    fn test_fingerprint_ignores_insertion_order() {
        let a = Record::new("term_1").with("name", "Rust").with("slug", "rust");
        let b = Record::new("term_1").with("slug", "rust").with("name", "Rust");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Record::new("term_1").with("name", "Go").with("slug", "rust");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_remote_json_roundtrip_keeps_fingerprint() {
        let record = Record::new("user_3")
            .with("display_name", "Ada")
            .with("posts_count", 12);
        let remote = serde_json::to_string(&record).unwrap();
        let parsed: Record = serde_json::from_str(&remote).unwrap();
        assert_eq!(parsed.object_id, "user_3");
        assert_eq!(parsed.fingerprint(), record.fingerprint());
    }
}
