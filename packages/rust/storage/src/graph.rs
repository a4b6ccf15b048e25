//! Graph database writes and statistics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use kbforge_shared::{GraphNode, GraphRelationship, KbError, Result};
use libsql::params;

use crate::{Storage, db_err};

/// One bounded slice of the canonical graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphBatch {
    pub nodes: Vec<GraphNode>,
    pub relationships: Vec<GraphRelationship>,
}

impl GraphBatch {
    pub fn len(&self) -> usize {
        self.nodes.len() + self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bulk-write interface of the persistent graph store.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Write one batch. Either the whole batch lands or none of it does.
    async fn write_batch(&self, batch: &GraphBatch) -> Result<()>;
}

/// Node and relationship counts grouped by type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub nodes_by_type: BTreeMap<String, u64>,
    pub relationships_by_type: BTreeMap<String, u64>,
}

impl GraphStats {
    pub fn node_count(&self) -> u64 {
        self.nodes_by_type.values().sum()
    }

    pub fn relationship_count(&self) -> u64 {
        self.relationships_by_type.values().sum()
    }
}

#[async_trait]
impl GraphStore for Storage {
    async fn write_batch(&self, batch: &GraphBatch) -> Result<()> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(db_err)?;
        let now = Utc::now().to_rfc3339();

        for node in &batch.nodes {
            let props = encode_properties(&node.properties)?;
            tx.execute(
                "INSERT INTO graph_nodes (id, type, properties_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   type = excluded.type,
                   properties_json = excluded.properties_json,
                   updated_at = excluded.updated_at",
                params![
                    node.id.as_str(),
                    node.node_type.as_str(),
                    props,
                    now.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        }

        for rel in &batch.relationships {
            let props = encode_properties(&rel.properties)?;
            tx.execute(
                "INSERT OR IGNORE INTO graph_relationships
                   (source, target, type, properties_json, structural_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    rel.source.as_str(),
                    rel.target.as_str(),
                    rel.rel_type.as_str(),
                    props,
                    rel.structural_key()
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

impl Storage {
    /// Delete every node and relationship (used by `--fresh` rebuilds).
    pub async fn clear_graph(&self) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute_batch("DELETE FROM graph_relationships; DELETE FROM graph_nodes;")
            .await
            .map_err(db_err)?;
        tracing::info!("cleared graph store");
        Ok(())
    }

    /// Count nodes and relationships by type.
    pub async fn graph_stats(&self) -> Result<GraphStats> {
        Ok(GraphStats {
            nodes_by_type: self
                .count_by_type("SELECT type, COUNT(*) FROM graph_nodes GROUP BY type")
                .await?,
            relationships_by_type: self
                .count_by_type("SELECT type, COUNT(*) FROM graph_relationships GROUP BY type")
                .await?,
        })
    }

    async fn count_by_type(&self, sql: &str) -> Result<BTreeMap<String, u64>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;
        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let kind: String = row.get(0).map_err(db_err)?;
            let count: i64 = row.get(1).map_err(db_err)?;
            counts.insert(kind, count as u64);
        }
        Ok(counts)
    }
}

fn encode_properties(props: &kbforge_shared::Properties) -> Result<String> {
    serde_json::to_string(props).map_err(|e| KbError::Storage(format!("encode properties: {e}")))
}
