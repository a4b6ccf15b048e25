//! Lenient decoding of model output into an [`ExtractedGraph`].

use std::sync::LazyLock;

use kbforge_shared::{ExtractedGraph, GraphNode, GraphRelationship, KbError, Properties, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct RawGraph {
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: serde_json::Value,
    #[serde(rename = "type", default)]
    node_type: Option<String>,
    #[serde(default)]
    properties: Option<Properties>,
}

/// Models sometimes emit `{"id": .., "type": ..}` instead of a bare id.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeRef {
    Node { id: serde_json::Value },
    Id(serde_json::Value),
}

impl NodeRef {
    fn into_id(self) -> Option<String> {
        match self {
            Self::Node { id } => value_to_id(id),
            Self::Id(id) => value_to_id(id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    source: NodeRef,
    target: NodeRef,
    #[serde(rename = "type")]
    rel_type: String,
    #[serde(default)]
    properties: Option<Properties>,
}

/// Ids may come back as numbers; anything else is unusable.
fn value_to_id(value: serde_json::Value) -> Option<String> {
    let id = match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let id = id.trim().to_string();
    (!id.is_empty()).then_some(id)
}

/// Remove a surrounding Markdown code fence, if any.
pub(crate) fn strip_code_fence(content: &str) -> &str {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n(.*?)\n?\s*```\s*$").expect("valid regex")
    });

    match FENCE_RE.captures(content).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => content.trim(),
    }
}

/// Decode the assistant message into a graph, dropping unusable entries.
pub(crate) fn parse_graph_response(content: &str) -> Result<ExtractedGraph> {
    let json = strip_code_fence(content);
    let raw: RawGraph = serde_json::from_str(json)
        .map_err(|e| KbError::Extraction(format!("model output is not a graph object: {e}")))?;

    let total_nodes = raw.nodes.len();
    let nodes: Vec<GraphNode> = raw
        .nodes
        .into_iter()
        .filter_map(|n| {
            Some(GraphNode {
                id: value_to_id(n.id)?,
                node_type: n
                    .node_type
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "Entity".into()),
                properties: n.properties.unwrap_or_default(),
            })
        })
        .collect();

    let total_rels = raw.relationships.len();
    let relationships: Vec<GraphRelationship> = raw
        .relationships
        .into_iter()
        .filter_map(|r| {
            let rel_type = r.rel_type.trim().to_string();
            if rel_type.is_empty() {
                return None;
            }
            Some(GraphRelationship {
                source: r.source.into_id()?,
                target: r.target.into_id()?,
                rel_type,
                properties: r.properties.unwrap_or_default(),
            })
        })
        .collect();

    if nodes.len() < total_nodes || relationships.len() < total_rels {
        debug!(
            dropped_nodes = total_nodes - nodes.len(),
            dropped_relationships = total_rels - relationships.len(),
            "dropped malformed graph entries"
        );
    }

    Ok(ExtractedGraph {
        nodes,
        relationships,
    })
}
