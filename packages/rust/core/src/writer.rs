//! Paced, batched load of the canonical graph into a [`GraphStore`].

use std::time::Duration;

use kbforge_shared::{GraphConfig, GraphNode, GraphRelationship};
use kbforge_storage::{GraphBatch, GraphStore};
use tracing::{info, instrument, warn};

use crate::aggregate::AggregatedGraph;
use crate::pipeline::ProgressReporter;

/// Counts from one write run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub batches_total: usize,
    pub batches_written: usize,
    pub batches_failed: usize,
    pub nodes_written: usize,
    pub relationships_written: usize,
}

/// Writes nodes first, then relationships, `batch_size` items per call.
#[derive(Debug, Clone)]
pub struct BatchedGraphWriter {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for BatchedGraphWriter {
    fn default() -> Self {
        Self::from_config(&GraphConfig::default())
    }
}

impl BatchedGraphWriter {
    pub fn from_config(config: &GraphConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            max_attempts: config.max_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Split the graph into batches in write order.
    pub fn plan(&self, graph: &AggregatedGraph) -> Vec<GraphBatch> {
        enum Item<'g> {
            Node(&'g GraphNode),
            Rel(&'g GraphRelationship),
        }

        let items: Vec<Item<'_>> = graph
            .nodes()
            .iter()
            .map(Item::Node)
            .chain(graph.relationships().iter().map(Item::Rel))
            .collect();

        items
            .chunks(self.batch_size.max(1))
            .map(|chunk| {
                let mut batch = GraphBatch::default();
                for item in chunk {
                    match item {
                        Item::Node(n) => batch.nodes.push((*n).clone()),
                        Item::Rel(r) => batch.relationships.push((*r).clone()),
                    }
                }
                batch
            })
            .collect()
    }

    /// Write every batch in sequence. A batch that exhausts its attempts is
    /// logged and counted; later batches are still written.
    #[instrument(skip_all, fields(items = graph.item_count(), batch_size = self.batch_size))]
    pub async fn write(
        &self,
        store: &dyn GraphStore,
        graph: &AggregatedGraph,
        progress: &dyn ProgressReporter,
    ) -> WriteReport {
        let batches = self.plan(graph);
        let mut report = WriteReport {
            batches_total: batches.len(),
            ..WriteReport::default()
        };

        for (i, batch) in batches.iter().enumerate() {
            if i > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            progress.item(i + 1, batches.len(), "writing graph batch");

            match self.write_with_retry(store, batch, i + 1).await {
                Ok(()) => {
                    report.batches_written += 1;
                    report.nodes_written += batch.nodes.len();
                    report.relationships_written += batch.relationships.len();
                }
                Err(error) => {
                    warn!(batch = i + 1, items = batch.len(), %error, "graph batch failed, continuing");
                    report.batches_failed += 1;
                }
            }
        }

        info!(
            batches = report.batches_total,
            written = report.batches_written,
            failed = report.batches_failed,
            nodes = report.nodes_written,
            relationships = report.relationships_written,
            "graph write finished"
        );
        report
    }

    async fn write_with_retry(
        &self,
        store: &dyn GraphStore,
        batch: &GraphBatch,
        number: usize,
    ) -> kbforge_shared::Result<()> {
        let mut attempt = 1;
        loop {
            match store.write_batch(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_attempts => {
                    warn!(batch = number, attempt, error = %e, "graph batch failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{GraphAggregator, MergePolicy};
    use crate::pipeline::SilentProgress;
    use crate::testing::RecordingGraphStore;
    use kbforge_shared::{ExtractedGraph, ExtractionUnit};

    fn graph(nodes: usize, rels: usize) -> AggregatedGraph {
        let mut agg = GraphAggregator::new(MergePolicy::default());
        agg.add_unit(&ExtractionUnit::new(
            "u",
            None,
            ExtractedGraph {
                nodes: (0..nodes).map(|i| GraphNode::new(format!("n{i}"), "Thing")).collect(),
                relationships: (0..rels)
                    .map(|i| GraphRelationship::new("n0", format!("n{i}"), "LINKS"))
                    .collect(),
            },
        ));
        agg.finish().0
    }

    fn writer(batch_size: usize, max_attempts: u32) -> BatchedGraphWriter {
        BatchedGraphWriter {
            batch_size,
            batch_delay: Duration::ZERO,
            max_attempts,
            retry_delay: Duration::ZERO,
        }
    }

    #[test]
    fn plan_puts_nodes_before_relationships() {
        let batches = writer(4, 1).plan(&graph(5, 3));
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].nodes.len(), 4);
        assert_eq!(batches[1].nodes.len(), 1);
        assert_eq!(batches[1].relationships.len(), 3);
    }

    #[tokio::test]
    async fn writes_ceil_m_over_b_batches() {
        for (m_nodes, m_rels, b) in [(10, 0, 3), (7, 5, 4), (1, 0, 50), (50, 50, 50)] {
            let store = RecordingGraphStore::default();
            let report = writer(b, 1)
                .write(&store, &graph(m_nodes, m_rels), &SilentProgress)
                .await;
            let m = m_nodes + m_rels;
            assert_eq!(store.calls(), m.div_ceil(b), "M={m} B={b}");
            assert_eq!(report.batches_written, m.div_ceil(b));
            assert_eq!(report.nodes_written, m_nodes);
            assert_eq!(report.relationships_written, m_rels);
        }
    }

    #[tokio::test]
    async fn failed_batch_does_not_stop_later_batches() {
        let store = RecordingGraphStore::failing([1]);
        let report = writer(2, 1).write(&store, &graph(6, 0), &SilentProgress).await;

        assert_eq!(store.calls(), 3);
        assert_eq!(report.batches_failed, 1);
        assert_eq!(report.batches_written, 2);
        let written = store.written.lock().unwrap();
        assert_eq!(written[1].nodes[0].id, "n4");
    }

    #[tokio::test]
    async fn retry_recovers_a_failed_batch() {
        let store = RecordingGraphStore::failing([0]);
        let report = writer(10, 2).write(&store, &graph(3, 0), &SilentProgress).await;
        assert_eq!(store.calls(), 2);
        assert_eq!(report.batches_written, 1);
        assert_eq!(report.batches_failed, 0);
    }

    #[tokio::test]
    async fn empty_graph_writes_nothing() {
        let store = RecordingGraphStore::default();
        let report = writer(50, 1).write(&store, &graph(0, 0), &SilentProgress).await;
        assert_eq!(store.calls(), 0);
        assert_eq!(report, WriteReport::default());
    }
}
