//! Graph domain types: nodes, relationships, and extraction checkpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current schema version for checkpoint files.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Free-form node/relationship properties, kept sorted by key.
pub type Properties = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// GraphNode / GraphRelationship
// ---------------------------------------------------------------------------

/// An entity extracted from text. `id` is the deduplication key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// A typed, directed edge between two node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: Properties,
}

impl GraphRelationship {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        rel_type: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            rel_type: rel_type.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Value-based identity: `(source, target, type, properties)` as canonical JSON.
    ///
    /// Nested objects are re-keyed in sorted order so two relationships that
    /// compare equal always produce the same key.
    pub fn structural_key(&self) -> String {
        let props = self
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), canonicalize(v)))
            .collect::<serde_json::Map<_, _>>();

        Value::Array(vec![
            Value::String(self.source.clone()),
            Value::String(self.target.clone()),
            Value::String(self.rel_type.clone()),
            Value::Object(props),
        ])
        .to_string()
    }
}

/// Rebuild a JSON value with object keys inserted in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Extraction results
// ---------------------------------------------------------------------------

/// The raw output of one extractor call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedGraph {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub relationships: Vec<GraphRelationship>,
}

impl ExtractedGraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }
}

/// Immutable checkpoint holding the graph extracted from one source unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionUnit {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// Source unit path relative to the source root (forward slashes).
    pub source: String,
    /// When the extractor produced this graph.
    pub extracted_at: DateTime<Utc>,
    /// Extractor model identifier, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub relationships: Vec<GraphRelationship>,
}

impl ExtractionUnit {
    pub fn new(source: impl Into<String>, model: Option<String>, graph: ExtractedGraph) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            source: source.into(),
            extracted_at: Utc::now(),
            model,
            nodes: graph.nodes,
            relationships: graph.relationships,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structural_key_is_value_based() {
        let a = GraphRelationship::new("A", "B", "WORKS_FOR").with_property("since", 2020);
        let b = GraphRelationship::new("A", "B", "WORKS_FOR").with_property("since", 2020);
        assert_eq!(a.structural_key(), b.structural_key());

        let c = GraphRelationship::new("A", "B", "WORKS_FOR").with_property("since", 2021);
        assert_ne!(a.structural_key(), c.structural_key());

        let d = GraphRelationship::new("B", "A", "WORKS_FOR").with_property("since", 2020);
        assert_ne!(a.structural_key(), d.structural_key());
    }

    #[test]
    fn structural_key_ignores_nested_key_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": {"p": 1, "q": 2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": {"q": 2, "p": 1}, "x": 1}"#).unwrap();
        let ra = GraphRelationship::new("A", "B", "R").with_property("meta", a);
        let rb = GraphRelationship::new("A", "B", "R").with_property("meta", b);
        assert_eq!(ra.structural_key(), rb.structural_key());
    }

    #[test]
    fn node_uses_type_field_name() {
        let node = GraphNode::new("Alice", "Person").with_property("age", 30);
        let v = serde_json::to_value(&node).unwrap();
        assert_eq!(v, json!({"id": "Alice", "type": "Person", "properties": {"age": 30}}));

        let parsed: GraphNode = serde_json::from_str(r#"{"id": "Bob", "type": "Person"}"#).unwrap();
        assert!(parsed.properties.is_empty());
    }

    #[test]
    fn checkpoint_serialization() {
        let graph = ExtractedGraph {
            nodes: vec![GraphNode::new("A", "Person")],
            relationships: vec![GraphRelationship::new("A", "B", "KNOWS")],
        };
        let unit = ExtractionUnit::new("laws/policy.chunks.json", Some("glm-4-long".into()), graph);
        let json = serde_json::to_string_pretty(&unit).unwrap();
        let parsed: ExtractionUnit = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, unit);
        assert_eq!(parsed.schema_version, CHECKPOINT_SCHEMA_VERSION);
    }
}
