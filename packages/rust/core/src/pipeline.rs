//! End-to-end flows.
//!
//! - conversion: metadata → submit → poll → archives on disk → markdown
//! - graph build: chunks → checkpoints → canonical graph → graph store

use std::path::PathBuf;
use std::time::{Duration, Instant};

use kbforge_extract::GraphExtractor;
use kbforge_remote::BatchApi;
use kbforge_shared::{Result, load_source_manifest};
use kbforge_storage::{GraphStore, TaskStore};
use tracing::{info, instrument};

use crate::aggregate::{AggregationStats, MergePolicy, aggregate_checkpoints};
use crate::extraction::{ExtractionReport, GraphExtractionStage};
use crate::materialize::ResultMaterializer;
use crate::orchestrator::{PollPolicy, PollReport, PollingOrchestrator};
use crate::submit::{SubmitReport, Submitter};
use crate::unpack::{UnpackReport, unpack_archives};
use crate::writer::{BatchedGraphWriter, WriteReport};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for long-running flows.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once per item within the current phase.
    fn item(&self, current: usize, total: usize, detail: &str);
    /// Called when a flow completes.
    fn finish(&self, _summary: &str) {}
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item(&self, _current: usize, _total: usize, _detail: &str) {}
}

// ---------------------------------------------------------------------------
// Conversion flow
// ---------------------------------------------------------------------------

/// Which halves of the conversion flow to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversionMode {
    #[default]
    Full,
    SubmitOnly,
    PollOnly,
}

impl ConversionMode {
    fn submits(self) -> bool {
        self != Self::PollOnly
    }

    fn polls(self) -> bool {
        self != Self::SubmitOnly
    }
}

/// Collaborators and paths for [`run_conversion`].
pub struct ConversionFlow<'a> {
    pub api: &'a dyn BatchApi,
    pub store: &'a dyn TaskStore,
    pub materializer: &'a ResultMaterializer,
    /// Root of the raw files; relative directories are computed against it.
    pub raw_dir: PathBuf,
    /// The `metadata.json` source manifest.
    pub metadata_file: PathBuf,
    pub policy: PollPolicy,
}

/// Result of [`run_conversion`].
#[derive(Debug, Default)]
pub struct ConversionReport {
    pub submit: Option<SubmitReport>,
    pub poll: Option<PollReport>,
    /// Archive unpacking; runs whenever polling does.
    pub unpack: Option<UnpackReport>,
    pub elapsed: Duration,
}

/// Submit new sources, poll active tasks to completion and unpack the
/// downloaded archives.
///
/// The manifest is only read when submitting; a poll-only run works off the
/// task store alone.
#[instrument(skip_all, fields(mode = ?mode, metadata = %flow.metadata_file.display()))]
pub async fn run_conversion(
    flow: &ConversionFlow<'_>,
    mode: ConversionMode,
    progress: &dyn ProgressReporter,
) -> Result<ConversionReport> {
    let start = Instant::now();
    let mut report = ConversionReport::default();

    if mode.submits() {
        progress.phase("Submitting files");
        let manifest = load_source_manifest(&flow.metadata_file)?;
        info!(entries = manifest.len(), "loaded source manifest");

        let submitter = Submitter::new(
            flow.api,
            flow.store,
            &flow.raw_dir,
            flow.materializer.layout().clone(),
        );
        report.submit = Some(submitter.submit_all(&manifest, progress).await?);
    }

    if mode.polls() {
        progress.phase("Polling conversions");
        let orchestrator = PollingOrchestrator::new(
            flow.api,
            flow.store,
            flow.materializer,
            flow.policy.clone(),
        );
        report.poll = Some(orchestrator.run(progress).await?);

        progress.phase("Unpacking results");
        report.unpack = Some(unpack_archives(
            &flow.materializer.layout().output_dir,
            progress,
        )?);
    }

    report.elapsed = start.elapsed();
    progress.finish("conversion finished");
    info!(elapsed_ms = report.elapsed.as_millis(), "conversion flow complete");
    Ok(report)
}

// ---------------------------------------------------------------------------
// Graph build flow
// ---------------------------------------------------------------------------

/// Inputs for [`run_graph_build`].
#[derive(Debug, Clone)]
pub struct GraphBuildOptions {
    /// Root of the split source units.
    pub source_root: PathBuf,
    /// Root of the per-unit checkpoints.
    pub checkpoint_root: PathBuf,
    pub merge_policy: MergePolicy,
    pub writer: BatchedGraphWriter,
}

/// Result of [`run_graph_build`].
#[derive(Debug, Default)]
pub struct GraphBuildReport {
    /// `None` when extraction was skipped.
    pub extraction: Option<ExtractionReport>,
    pub aggregation: AggregationStats,
    pub nodes: usize,
    pub relationships: usize,
    pub write: WriteReport,
    pub elapsed: Duration,
}

/// Extract (when an extractor is given), aggregate every checkpoint, and
/// write the canonical graph in batches.
#[instrument(skip_all, fields(checkpoints = %options.checkpoint_root.display()))]
pub async fn run_graph_build(
    options: &GraphBuildOptions,
    extractor: Option<&dyn GraphExtractor>,
    store: &dyn GraphStore,
    progress: &dyn ProgressReporter,
) -> Result<GraphBuildReport> {
    let start = Instant::now();
    let mut report = GraphBuildReport::default();

    if let Some(extractor) = extractor {
        progress.phase("Extracting graph units");
        let stage =
            GraphExtractionStage::new(extractor, &options.source_root, &options.checkpoint_root);
        report.extraction = Some(stage.run(progress).await?);
    }

    progress.phase("Aggregating checkpoints");
    let (graph, stats) =
        aggregate_checkpoints(&options.checkpoint_root, options.merge_policy.clone())?;
    report.aggregation = stats;
    report.nodes = graph.nodes().len();
    report.relationships = graph.relationships().len();

    progress.phase("Writing graph");
    report.write = options.writer.write(store, &graph, progress).await;

    report.elapsed = start.elapsed();
    progress.finish("graph build finished");
    info!(
        nodes = report.nodes,
        relationships = report.relationships,
        batches_failed = report.write.batches_failed,
        elapsed_ms = report.elapsed.as_millis(),
        "graph build complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::OutputLayout;
    use crate::testing::{
        RecordingGraphStore, ScriptedBatchApi, ScriptedExtractor, result, temp_dir, zip_bytes,
    };
    use kbforge_remote::{BatchStatus, RemoteState};
    use kbforge_shared::{ExtractedGraph, GraphNode, GraphRelationship, TaskState};
    use kbforge_storage::JsonTaskStore;
    use serde_json::json;
    use std::path::Path;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_manifest(root: &Path) -> (PathBuf, PathBuf) {
        let raw = root.join("raw");
        std::fs::create_dir_all(raw.join("laws")).unwrap();
        std::fs::write(raw.join("laws").join("a.pdf"), b"%PDF a").unwrap();
        std::fs::write(raw.join("b.docx"), b"docx b").unwrap();

        let manifest = json!({
            "u-a": {"file_name": "a.pdf", "absolute_path": raw.join("laws").join("a.pdf")},
            "u-b": {"file_name": "b.docx", "absolute_path": raw.join("b.docx"), "size": 6},
        });
        let metadata = root.join("metadata.json");
        std::fs::write(&metadata, manifest.to_string()).unwrap();
        (raw, metadata)
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            backoff_factor: 2.0,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn conversion_submits_polls_and_materializes() {
        let root = temp_dir();
        let (raw, metadata) = write_manifest(&root);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(zip_bytes(&[("full.md", "# converted")])),
            )
            .expect(2)
            .mount(&server)
            .await;
        let zip = format!("{}/result.zip", server.uri());

        // One file per batch: batch-1 holds u-a, batch-2 holds u-b.
        let api = ScriptedBatchApi::new(move |batch, call| {
            let id = if batch == "batch-1" { "u-a" } else { "u-b" };
            let state = if call >= 2 {
                RemoteState::Done { zip_url: zip.clone() }
            } else {
                RemoteState::InProgress("converting".into())
            };
            Ok(BatchStatus {
                batch_id: batch.into(),
                results: vec![result(id, state)],
            })
        });
        let store = JsonTaskStore::open(&root.join("tasks.json")).unwrap();
        let out = root.join("out");
        let materializer = ResultMaterializer::new(reqwest::Client::new(), OutputLayout::new(&out));

        let flow = ConversionFlow {
            api: &api,
            store: &store,
            materializer: &materializer,
            raw_dir: raw,
            metadata_file: metadata,
            policy: fast_policy(),
        };
        let report = run_conversion(&flow, ConversionMode::Full, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(report.submit.unwrap().submitted, 2);
        let poll = report.poll.unwrap();
        assert_eq!(poll.downloaded, 2);
        assert_eq!(poll.still_active, 0);
        assert!(out.join("laws").join("a.zip").exists());
        assert!(out.join("b.zip").exists());
        let unpack = report.unpack.unwrap();
        assert_eq!(unpack.unpacked, 2);
        assert!(unpack.failed.is_empty());
        assert_eq!(
            std::fs::read_to_string(out.join("laws").join("a.md")).unwrap(),
            "# converted"
        );
        assert!(out.join("b.md").exists());
        for task in store.list().await.unwrap() {
            assert!(matches!(task.state, TaskState::Done { .. }));
        }
    }

    #[tokio::test]
    async fn submit_only_leaves_tasks_active() {
        let root = temp_dir();
        let (raw, metadata) = write_manifest(&root);
        let api = ScriptedBatchApi::submit_only();
        let store = JsonTaskStore::open(&root.join("tasks.json")).unwrap();
        let materializer =
            ResultMaterializer::new(reqwest::Client::new(), OutputLayout::new(root.join("out")));

        let flow = ConversionFlow {
            api: &api,
            store: &store,
            materializer: &materializer,
            raw_dir: raw,
            metadata_file: metadata,
            policy: fast_policy(),
        };
        let report = run_conversion(&flow, ConversionMode::SubmitOnly, &SilentProgress)
            .await
            .unwrap();

        assert!(report.poll.is_none());
        assert!(report.unpack.is_none());
        assert_eq!(api.total_status_calls(), 0);
        assert_eq!(store.list_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn poll_only_ignores_missing_manifest() {
        let root = temp_dir();
        let api = ScriptedBatchApi::submit_only();
        let store = JsonTaskStore::open(&root.join("tasks.json")).unwrap();
        let materializer =
            ResultMaterializer::new(reqwest::Client::new(), OutputLayout::new(root.join("out")));

        let flow = ConversionFlow {
            api: &api,
            store: &store,
            materializer: &materializer,
            raw_dir: root.join("raw"),
            metadata_file: root.join("missing.json"),
            policy: fast_policy(),
        };
        let report = run_conversion(&flow, ConversionMode::PollOnly, &SilentProgress)
            .await
            .unwrap();
        assert!(report.submit.is_none());
        assert_eq!(report.poll.unwrap().cycles, 0);
    }

    fn build_options(root: &Path, batch_size: usize) -> GraphBuildOptions {
        GraphBuildOptions {
            source_root: root.join("chunks"),
            checkpoint_root: root.join("checkpoints"),
            merge_policy: MergePolicy::FirstWins,
            writer: BatchedGraphWriter {
                batch_size,
                batch_delay: Duration::ZERO,
                max_attempts: 1,
                retry_delay: Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    async fn graph_build_extracts_aggregates_and_writes() {
        let root = temp_dir();
        let source = root.join("chunks");
        std::fs::create_dir_all(&source).unwrap();
        for (name, text) in [("u1.md", "Alice Person"), ("u2.md", "Alice Organization")] {
            std::fs::write(source.join(name), text).unwrap();
        }

        let extractor = ScriptedExtractor::new(|text| {
            let mut words = text.split_whitespace();
            let id = words.next().unwrap_or_default();
            let kind = words.next().unwrap_or("Entity");
            Ok(ExtractedGraph {
                nodes: vec![GraphNode::new(id, kind), GraphNode::new("Acme", "Organization")],
                relationships: vec![GraphRelationship::new(id, "Acme", "MEMBER_OF")],
            })
        });
        let store = RecordingGraphStore::default();
        let options = build_options(&root, 2);

        let report = run_graph_build(&options, Some(&extractor), &store, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(report.extraction.as_ref().unwrap().processed, 2);
        assert_eq!(report.nodes, 2);
        assert_eq!(report.relationships, 1);
        assert_eq!(report.aggregation.duplicate_relationships, 1);
        assert_eq!(store.calls(), 2);

        let written = store.written.lock().unwrap();
        let alice = written
            .iter()
            .flat_map(|b| b.nodes.iter())
            .find(|n| n.id == "Alice")
            .unwrap();
        assert_eq!(alice.node_type, "Person");
    }

    #[tokio::test]
    async fn graph_build_without_extractor_uses_existing_checkpoints() {
        let root = temp_dir();
        let source = root.join("chunks");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("u1.md"), "Bob").unwrap();

        let extractor = ScriptedExtractor::new(|_| {
            Ok(ExtractedGraph {
                nodes: vec![GraphNode::new("Bob", "Person")],
                relationships: vec![],
            })
        });
        let options = build_options(&root, 50);
        run_graph_build(&options, Some(&extractor), &RecordingGraphStore::default(), &SilentProgress)
            .await
            .unwrap();

        let store = RecordingGraphStore::default();
        let report = run_graph_build(&options, None, &store, &SilentProgress)
            .await
            .unwrap();
        assert!(report.extraction.is_none());
        assert_eq!(extractor.calls(), 1);
        assert_eq!(report.nodes, 1);
        assert_eq!(store.calls(), 1);
    }
}
