//! Path-addressed, read-only view over an agency store snapshot.
//!
//! A [`Node`] wraps an immutable `serde_json::Value` copied out of the
//! consensus layer under its read lock. Navigation is pure; callers never
//! mutate through a view. Paths are `/`-separated and normalized before use.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static EMPTY_OBJECT: LazyLock<Map<String, Value>> = LazyLock::new(Map::new);

/// Normalize a path: leading `/`, no duplicated or trailing separators.
///
/// The root is spelled `/`.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// An immutable snapshot of a subtree of the agency store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Node {
    value: Value,
}

impl Default for Node {
    fn default() -> Self {
        Self::new()
    }
}

impl Node {
    /// An empty tree (an object with no children).
    pub fn new() -> Self {
        Self {
            value: Value::Object(Map::new()),
        }
    }

    pub fn from_value(value: Value) -> Self {
        Self { value }
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Borrowed value at `path`, if present.
    pub fn value_at(&self, path: &str) -> Option<&Value> {
        let mut current = &self.value;
        for segment in segments(path) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn has(&self, path: &str) -> bool {
        self.value_at(path).is_some()
    }

    /// Owned sub-view rooted at `path`, if present.
    pub fn node_at(&self, path: &str) -> Option<Node> {
        self.value_at(path).cloned().map(Node::from_value)
    }

    pub fn string_at(&self, path: &str) -> Option<&str> {
        self.value_at(path)?.as_str()
    }

    pub fn uint_at(&self, path: &str) -> Option<u64> {
        self.value_at(path)?.as_u64()
    }

    pub fn bool_at(&self, path: &str) -> Option<bool> {
        self.value_at(path)?.as_bool()
    }

    /// Ordered name-to-value mapping below `path`.
    ///
    /// Empty when the path is absent or does not hold an object. Iteration
    /// order is the map's key order, which callers rely on for deterministic
    /// sweeps.
    pub fn children(&self, path: &str) -> &Map<String, Value> {
        match self.value_at(path) {
            Some(Value::Object(map)) => map,
            _ => &EMPTY_OBJECT,
        }
    }

    pub fn to_json(&self) -> String {
        self.value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Node {
        Node::from_value(json!({
            "Plan": {
                "DBServers": {
                    "PRMR-b": "none",
                    "PRMR-a": "none",
                },
                "Version": 7,
            },
            "Supervision": {
                "Maintenance": true,
            },
            "Current": {
                "Foxxmaster": "CRDN-1",
            },
        }))
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path("Plan/DBServers"), "/Plan/DBServers");
        assert_eq!(normalize_path("//Plan///DBServers/"), "/Plan/DBServers");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn navigates_with_any_path_spelling() {
        let node = sample();
        assert!(node.has("/Plan/DBServers/PRMR-a"));
        assert!(node.has("Plan/DBServers/PRMR-a"));
        assert!(node.has("//Plan//DBServers//PRMR-a"));
        assert!(!node.has("/Plan/DBServers/PRMR-c"));
    }

    #[test]
    fn typed_getters() {
        let node = sample();
        assert_eq!(node.string_at("/Current/Foxxmaster"), Some("CRDN-1"));
        assert_eq!(node.uint_at("/Plan/Version"), Some(7));
        assert_eq!(node.bool_at("/Supervision/Maintenance"), Some(true));
        // Wrong type reads as absent.
        assert_eq!(node.string_at("/Plan/Version"), None);
        assert_eq!(node.uint_at("/Missing"), None);
    }

    #[test]
    fn children_are_key_ordered_and_empty_when_absent() {
        let node = sample();
        let names: Vec<&str> = node
            .children("/Plan/DBServers")
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(names, vec!["PRMR-a", "PRMR-b"]);
        assert!(node.children("/Plan/Missing").is_empty());
        assert!(node.children("/Current/Foxxmaster").is_empty());
    }

    #[test]
    fn subtree_views() {
        let node = sample();
        let plan = node.node_at("/Plan").expect("plan subtree");
        assert_eq!(plan.uint_at("/Version"), Some(7));
        assert!(plan.node_at("/Nope").is_none());
    }
}
