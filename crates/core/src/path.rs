//! Dotted field paths into an entity's document tree
//!
//! `"address.city"` walks object members; a numeric segment such as
//! `"tags.0"` indexes into an array.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Path from the root of an entity to one of its fields
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path; empty segments are dropped
    pub fn parse(path: &str) -> Self {
        FieldPath {
            segments: path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Path segments in order
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True for the empty path, which resolves to the document itself
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Walk the path through a JSON document
    pub fn resolve<'a>(&self, doc: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        let mut node = doc;
        for segment in &self.segments {
            node = match node {
                serde_json::Value::Object(map) => map.get(segment)?,
                serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node)
    }

    /// Resolve the path and convert the node to a scalar [`Value`]
    pub fn resolve_value(&self, doc: &serde_json::Value) -> Option<Value> {
        self.resolve(doc).and_then(Value::from_json)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        FieldPath::parse(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        FieldPath::parse(&path)
    }
}
