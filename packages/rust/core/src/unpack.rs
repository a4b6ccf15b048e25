//! Unpacking of downloaded result archives.
//!
//! Every `<stem>.zip` under the output root is extracted into `<stem>/` next
//! to it, and the `full.md` it carries is moved to `<stem>.md`. An archive
//! whose `<stem>.md` already exists is left alone.

use std::fs::File;
use std::path::{Path, PathBuf};

use kbforge_shared::{KbError, Result, find_files, relative_slash_path};
use tracing::{debug, info, instrument, warn};
use zip::ZipArchive;

use crate::pipeline::ProgressReporter;

/// Name of the converted document inside a result archive.
pub const MARKDOWN_ENTRY: &str = "full.md";

/// Counts from one unpacking pass.
#[derive(Debug, Default, Clone)]
pub struct UnpackReport {
    pub unpacked: usize,
    /// Archives whose markdown was already in place.
    pub already_unpacked: usize,
    /// `(archive, error)` relative to the output root.
    pub failed: Vec<(String, String)>,
}

/// Unpack every archive under `output_dir` that has no markdown yet.
#[instrument(skip_all, fields(root = %output_dir.display()))]
pub fn unpack_archives(output_dir: &Path, progress: &dyn ProgressReporter) -> Result<UnpackReport> {
    let archives = find_files(output_dir, &[".zip"])?;
    let mut report = UnpackReport::default();
    info!(archives = archives.len(), "unpacking result archives");

    for (i, archive) in archives.iter().enumerate() {
        let relative = relative_slash_path(output_dir, archive);
        progress.item(i + 1, archives.len(), &relative);

        let markdown = archive.with_extension("md");
        if markdown.exists() {
            debug!(archive = %relative, "markdown present, skipping");
            report.already_unpacked += 1;
            continue;
        }

        match unpack_archive(archive, &markdown) {
            Ok(entries) => {
                info!(archive = %relative, entries, markdown = %markdown.display(), "archive unpacked");
                report.unpacked += 1;
            }
            Err(e) => {
                warn!(archive = %relative, error = %e, "failed to unpack archive");
                report.failed.push((relative, e.to_string()));
            }
        }
    }

    Ok(report)
}

/// Extract `archive` into the directory named after its stem and move the
/// contained `full.md` to `markdown`. Returns the number of files written.
pub fn unpack_archive(archive: &Path, markdown: &Path) -> Result<usize> {
    let target_dir = archive.with_extension("");
    let file = File::open(archive).map_err(|e| KbError::io(archive, e))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| KbError::validation(format!("{} is not a valid zip: {e}", archive.display())))?;

    let mut written = 0;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| KbError::validation(format!("{}: entry {i}: {e}", archive.display())))?;
        let Some(name) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping entry with unsafe path");
            continue;
        };
        let path = target_dir.join(name);

        if entry.is_dir() {
            std::fs::create_dir_all(&path).map_err(|e| KbError::io(&path, e))?;
            continue;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KbError::io(parent, e))?;
        }
        let mut out = File::create(&path).map_err(|e| KbError::io(&path, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| KbError::io(&path, e))?;
        written += 1;
    }

    let found = find_markdown_entry(&target_dir)?.ok_or_else(|| {
        KbError::validation(format!(
            "{} contains no {MARKDOWN_ENTRY}",
            archive.display()
        ))
    })?;
    std::fs::rename(&found, markdown).map_err(|e| KbError::io(markdown, e))?;
    Ok(written)
}

/// The shallowest `full.md` below `dir`.
fn find_markdown_entry(dir: &Path) -> Result<Option<PathBuf>> {
    Ok(find_files(dir, &[MARKDOWN_ENTRY])?
        .into_iter()
        .filter(|p| p.file_name().is_some_and(|n| n == MARKDOWN_ENTRY))
        .min_by_key(|p| p.components().count()))
}
