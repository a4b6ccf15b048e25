//! Merge of all extraction checkpoints into one deduplicated graph.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use kbforge_shared::{
    ExtractionUnit, GraphNode, GraphRelationship, MergePolicyKind, Result, find_files,
    relative_slash_path,
};
use tracing::{debug, info, instrument, warn};

use crate::extraction::CHECKPOINT_SUFFIX;

// ---------------------------------------------------------------------------
// MergePolicy
// ---------------------------------------------------------------------------

/// Decides the surviving definition when two units define the same node id.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, existing: &GraphNode, incoming: &GraphNode) -> GraphNode;
}

/// Keeps the existing type and adds incoming properties whose keys are absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeProperties;

impl NodeResolver for MergeProperties {
    fn resolve(&self, existing: &GraphNode, incoming: &GraphNode) -> GraphNode {
        let mut merged = existing.clone();
        for (key, value) in &incoming.properties {
            merged
                .properties
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged
    }
}

/// Conflict-resolution policy for node ids seen more than once.
#[derive(Clone, Default)]
pub enum MergePolicy {
    /// Keep the earliest-visited definition.
    #[default]
    FirstWins,
    /// Replace with the latest-visited definition.
    LastWins,
    Custom(Arc<dyn NodeResolver>),
}

impl fmt::Debug for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstWins => f.write_str("FirstWins"),
            Self::LastWins => f.write_str("LastWins"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl From<MergePolicyKind> for MergePolicy {
    fn from(kind: MergePolicyKind) -> Self {
        match kind {
            MergePolicyKind::FirstWins => Self::FirstWins,
            MergePolicyKind::LastWins => Self::LastWins,
            MergePolicyKind::MergeProperties => Self::Custom(Arc::new(MergeProperties)),
        }
    }
}

impl MergePolicy {
    fn resolve(&self, existing: &GraphNode, incoming: &GraphNode) -> GraphNode {
        match self {
            Self::FirstWins => existing.clone(),
            Self::LastWins => incoming.clone(),
            Self::Custom(resolver) => resolver.resolve(existing, incoming),
        }
    }
}

// ---------------------------------------------------------------------------
// AggregatedGraph
// ---------------------------------------------------------------------------

/// The canonical graph: nodes keyed by id and relationships keyed by
/// structural identity, both in first-insertion order.
#[derive(Debug, Default, Clone)]
pub struct AggregatedGraph {
    nodes: Vec<GraphNode>,
    node_index: HashMap<String, usize>,
    relationships: Vec<GraphRelationship>,
    relationship_keys: HashSet<String>,
}

impl AggregatedGraph {
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn relationships(&self) -> &[GraphRelationship] {
        &self.relationships
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.node_index.get(id).map(|&i| &self.nodes[i])
    }

    /// Nodes plus relationships.
    pub fn item_count(&self) -> usize {
        self.nodes.len() + self.relationships.len()
    }
}

/// Counters collected while merging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregationStats {
    pub units_visited: usize,
    pub units_unreadable: usize,
    pub nodes_seen: usize,
    /// Repeated node ids whose definitions disagreed.
    pub node_conflicts: usize,
    pub relationships_seen: usize,
    pub duplicate_relationships: usize,
}

/// Folds extraction units into an [`AggregatedGraph`].
#[derive(Debug, Default)]
pub struct GraphAggregator {
    policy: MergePolicy,
    graph: AggregatedGraph,
    stats: AggregationStats,
}

impl GraphAggregator {
    pub fn new(policy: MergePolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Merge one unit's nodes and relationships.
    pub fn add_unit(&mut self, unit: &ExtractionUnit) {
        self.stats.units_visited += 1;

        for node in &unit.nodes {
            self.stats.nodes_seen += 1;
            match self.graph.node_index.get(&node.id) {
                None => {
                    self.graph
                        .node_index
                        .insert(node.id.clone(), self.graph.nodes.len());
                    self.graph.nodes.push(node.clone());
                }
                Some(&i) => {
                    let existing = &self.graph.nodes[i];
                    if existing != node {
                        self.stats.node_conflicts += 1;
                        debug!(
                            id = %node.id,
                            unit = %unit.source,
                            existing_type = %existing.node_type,
                            incoming_type = %node.node_type,
                            "conflicting node definition"
                        );
                    }
                    let resolved = self.policy.resolve(existing, node);
                    self.graph.nodes[i] = resolved;
                }
            }
        }

        for rel in &unit.relationships {
            self.stats.relationships_seen += 1;
            if self.graph.relationship_keys.insert(rel.structural_key()) {
                self.graph.relationships.push(rel.clone());
            } else {
                self.stats.duplicate_relationships += 1;
            }
        }
    }

    pub fn finish(self) -> (AggregatedGraph, AggregationStats) {
        (self.graph, self.stats)
    }
}

/// Merge every checkpoint under `root`, visited in lexicographic path order.
///
/// Unreadable or corrupt checkpoints are logged and skipped.
#[instrument(skip_all, fields(root = %root.display(), policy = ?policy))]
pub fn aggregate_checkpoints(
    root: &Path,
    policy: MergePolicy,
) -> Result<(AggregatedGraph, AggregationStats)> {
    let mut aggregator = GraphAggregator::new(policy);

    for path in find_files(root, &[CHECKPOINT_SUFFIX])? {
        let rel = relative_slash_path(root, &path);
        let unit = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str::<ExtractionUnit>(&s).map_err(|e| e.to_string()));

        match unit {
            Ok(unit) => aggregator.add_unit(&unit),
            Err(error) => {
                warn!(checkpoint = %rel, %error, "unreadable checkpoint, skipping");
                aggregator.stats.units_unreadable += 1;
            }
        }
    }

    let (graph, stats) = aggregator.finish();
    info!(
        units = stats.units_visited,
        nodes = graph.nodes().len(),
        relationships = graph.relationships().len(),
        node_conflicts = stats.node_conflicts,
        duplicate_relationships = stats.duplicate_relationships,
        "aggregated graph"
    );
    Ok((graph, stats))
}
