//! Checkpointed graph extraction over split source units.
//!
//! A source unit is either a `*.chunks.json` file (array of
//! `{page_content, metadata}`) or a plain `*.md` file. Each unit maps to one
//! checkpoint under `<checkpoint_root>` that keeps the unit's own suffix:
//! `a.chunks.json` -> `a.chunks.graph.json`, `a.md` -> `a.md.graph.json`.

use std::path::{Path, PathBuf};

use kbforge_extract::GraphExtractor;
use kbforge_shared::{ExtractionUnit, KbError, Result, find_files, relative_slash_path, write_atomic};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::pipeline::ProgressReporter;

/// Suffix of chunk files produced by the splitter.
pub const CHUNKS_SUFFIX: &str = ".chunks.json";
/// Suffix of plain markdown units.
pub const MARKDOWN_SUFFIX: &str = ".md";
/// Suffix of extraction checkpoints.
pub const CHECKPOINT_SUFFIX: &str = ".graph.json";

/// One chunk as written by the splitter. Chunk metadata is not used.
#[derive(Debug, Deserialize)]
struct Chunk {
    page_content: String,
}

/// A unit of source text discovered under the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Forward-slash path relative to the source root.
    pub relative_path: String,
    pub path: PathBuf,
}

impl SourceUnit {
    /// Relative checkpoint path. Distinct units never share a checkpoint,
    /// so `a.chunks.json` and `a.md` side by side are both extracted.
    pub fn checkpoint_relative(&self) -> String {
        let stem = self
            .relative_path
            .strip_suffix(".json")
            .unwrap_or(&self.relative_path);
        format!("{stem}{CHECKPOINT_SUFFIX}")
    }

    /// Full text of the unit: chunks joined by a blank line.
    pub fn read_text(&self) -> Result<String> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| KbError::io(&self.path, e))?;
        if !self.relative_path.ends_with(CHUNKS_SUFFIX) {
            return Ok(content);
        }

        let chunks: Vec<Chunk> = serde_json::from_str(&content).map_err(|e| {
            KbError::parse(format!("invalid chunk file {}: {e}", self.path.display()))
        })?;
        Ok(chunks
            .into_iter()
            .map(|c| c.page_content)
            .filter(|t| !t.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

/// List source units under `root`, sorted by relative path.
pub fn discover_units(root: &Path) -> Result<Vec<SourceUnit>> {
    Ok(find_files(root, &[CHUNKS_SUFFIX, MARKDOWN_SUFFIX])?
        .into_iter()
        .map(|path| SourceUnit {
            relative_path: relative_slash_path(root, &path),
            path,
        })
        .collect())
}

/// Counts from one extraction pass.
#[derive(Debug, Default, Clone)]
pub struct ExtractionReport {
    /// Units extracted and checkpointed in this run.
    pub processed: usize,
    /// Units whose checkpoint already existed.
    pub already_checkpointed: usize,
    /// `(unit, error)` for units left without a checkpoint.
    pub skipped: Vec<(String, String)>,
}

/// Runs the extractor once per unit that has no checkpoint yet.
pub struct GraphExtractionStage<'a> {
    extractor: &'a dyn GraphExtractor,
    source_root: PathBuf,
    checkpoint_root: PathBuf,
}

impl<'a> GraphExtractionStage<'a> {
    pub fn new(
        extractor: &'a dyn GraphExtractor,
        source_root: impl Into<PathBuf>,
        checkpoint_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            extractor,
            source_root: source_root.into(),
            checkpoint_root: checkpoint_root.into(),
        }
    }

    pub fn checkpoint_path(&self, unit: &SourceUnit) -> PathBuf {
        unit.checkpoint_relative()
            .split('/')
            .fold(self.checkpoint_root.clone(), |acc, part| acc.join(part))
    }

    #[instrument(skip_all, fields(source = %self.source_root.display()))]
    pub async fn run(&self, progress: &dyn ProgressReporter) -> Result<ExtractionReport> {
        let units = discover_units(&self.source_root)?;
        let mut report = ExtractionReport::default();
        info!(units = units.len(), "starting graph extraction");

        for (i, unit) in units.iter().enumerate() {
            progress.item(i + 1, units.len(), &unit.relative_path);

            let checkpoint = self.checkpoint_path(unit);
            if checkpoint.exists() {
                debug!(unit = %unit.relative_path, "checkpoint exists, skipping");
                report.already_checkpointed += 1;
                continue;
            }

            match self.extract_unit(unit, &checkpoint).await {
                Ok((nodes, relationships)) => {
                    info!(unit = %unit.relative_path, nodes, relationships, "unit checkpointed");
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(unit = %unit.relative_path, error = %e, "extraction failed, skipping unit");
                    report.skipped.push((unit.relative_path.clone(), e.to_string()));
                }
            }
        }

        info!(
            processed = report.processed,
            already_checkpointed = report.already_checkpointed,
            skipped = report.skipped.len(),
            "graph extraction finished"
        );
        Ok(report)
    }

    async fn extract_unit(&self, unit: &SourceUnit, checkpoint: &Path) -> Result<(usize, usize)> {
        let text = unit.read_text()?;
        if text.trim().is_empty() {
            return Err(KbError::validation("unit has no text"));
        }

        let graph = self.extractor.extract(&text).await?;
        let counts = (graph.nodes.len(), graph.relationships.len());

        let record = ExtractionUnit::new(
            unit.relative_path.clone(),
            self.extractor.model().map(String::from),
            graph,
        );
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| KbError::parse(format!("failed to encode checkpoint: {e}")))?;
        write_atomic(checkpoint, &json)?;
        Ok(counts)
    }
}
