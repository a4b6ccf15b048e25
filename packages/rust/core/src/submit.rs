//! Submission of raw files to the batch conversion service.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use kbforge_remote::{BatchApi, SubmitFile};
use kbforge_shared::{
    ConversionTask, KbError, Result, SourceEntry, SourceManifest, TaskEvent, TaskState,
};
use kbforge_storage::TaskStore;
use tracing::{debug, info, instrument, warn};

use crate::materialize::OutputLayout;
use crate::pipeline::ProgressReporter;

/// Counts from one submission pass.
#[derive(Debug, Default, Clone)]
pub struct SubmitReport {
    /// Accepted by the service and uploaded.
    pub submitted: usize,
    /// Result archive already on disk; marked done without a remote call.
    pub already_materialized: usize,
    /// Tasks that already carry a batch id or are terminal.
    pub already_tracked: usize,
    /// Markdown sources copied straight into the output layout.
    pub markdown_copied: usize,
    /// Markdown sources whose copy already existed.
    pub markdown_present: usize,
    /// `(id, error)` for entries that stay pending for the next run.
    pub failed: Vec<(String, String)>,
    /// `(id, owner)` for sources left pending because another source
    /// already produces the same `<stem>.zip`/`<stem>.md` output.
    pub output_conflicts: Vec<(String, String)>,
}

/// Creates tasks from the source manifest and submits pending ones.
pub struct Submitter<'a> {
    api: &'a dyn BatchApi,
    store: &'a dyn TaskStore,
    raw_dir: PathBuf,
    layout: OutputLayout,
}

impl<'a> Submitter<'a> {
    pub fn new(
        api: &'a dyn BatchApi,
        store: &'a dyn TaskStore,
        raw_dir: impl Into<PathBuf>,
        layout: OutputLayout,
    ) -> Self {
        Self {
            api,
            store,
            raw_dir: raw_dir.into(),
            layout,
        }
    }

    /// Submit every non-markdown entry that has no batch yet.
    ///
    /// Entries are visited in identity order. Per-entry failures are
    /// recorded in the report and the task stays `Pending`.
    #[instrument(skip_all, fields(entries = manifest.len()))]
    pub async fn submit_all(
        &self,
        manifest: &SourceManifest,
        progress: &dyn ProgressReporter,
    ) -> Result<SubmitReport> {
        let mut report = SubmitReport::default();
        let total = manifest.len();
        let owners = self.output_owners(manifest);

        for (i, (id, entry)) in manifest.iter().enumerate() {
            progress.item(i + 1, total, &entry.file_name);

            if entry.is_markdown() {
                match self.copy_markdown(&ConversionTask::from_source(id.as_str(), entry, &self.raw_dir)) {
                    Ok(true) => report.markdown_copied += 1,
                    Ok(false) => report.markdown_present += 1,
                    Err(e) => {
                        warn!(id = %id, error = %e, "markdown copy failed");
                        report.failed.push((id.clone(), e.to_string()));
                    }
                }
                continue;
            }

            let mut task = match self.store.get(id).await? {
                Some(task) if task.state != TaskState::Pending => {
                    debug!(task_id = %id, state = %task.state, "already tracked");
                    report.already_tracked += 1;
                    continue;
                }
                Some(task) => task,
                None => {
                    let task = ConversionTask::from_source(id.as_str(), entry, &self.raw_dir);
                    self.store.put(&task).await?;
                    task
                }
            };

            if let Some(owner) = owners
                .get(&self.layout.archive_path(&task).with_extension("md"))
                .filter(|owner| *owner != id)
            {
                warn!(
                    task_id = %id,
                    %owner,
                    file = %task.file_name,
                    "output already owned by another source, not converting"
                );
                report.output_conflicts.push((id.clone(), owner.clone()));
                continue;
            }

            if self.layout.archive_path(&task).exists() {
                task.apply(TaskEvent::AlreadyMaterialized)?;
                self.store.put(&task).await?;
                info!(task_id = %id, "result already present, marked done");
                report.already_materialized += 1;
                continue;
            }

            match self.submit_one(&task).await {
                Ok(batch_id) => {
                    task.apply(TaskEvent::Submitted {
                        batch_id: batch_id.clone(),
                    })?;
                    self.store.put(&task).await?;
                    info!(task_id = %id, %batch_id, file = %task.file_name, "submitted");
                    report.submitted += 1;
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "submission failed, will retry next run");
                    report.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        info!(
            submitted = report.submitted,
            already_materialized = report.already_materialized,
            already_tracked = report.already_tracked,
            markdown_copied = report.markdown_copied,
            failed = report.failed.len(),
            output_conflicts = report.output_conflicts.len(),
            "submission pass complete"
        );
        Ok(report)
    }

    /// Owner of every `<dir>/<stem>.md` output: markdown sources claim their
    /// copy first, then converted sources claim in identity order.
    fn output_owners(&self, manifest: &SourceManifest) -> HashMap<PathBuf, String> {
        let (markdown, converted): (Vec<_>, Vec<_>) =
            manifest.iter().partition(|(_, entry)| entry.is_markdown());
        let mut owners = HashMap::new();
        for (id, entry) in markdown.into_iter().chain(converted) {
            owners
                .entry(self.markdown_output(id, entry))
                .or_insert_with(|| id.clone());
        }
        owners
    }

    fn markdown_output(&self, id: &str, entry: &SourceEntry) -> PathBuf {
        let task = ConversionTask::from_source(id, entry, &self.raw_dir);
        if entry.is_markdown() {
            self.layout.copy_path(&task.relative_dir, &task.file_name)
        } else {
            self.layout.archive_path(&task).with_extension("md")
        }
    }

    /// Create a batch for one file and upload its bytes. Returns the batch id.
    async fn submit_one(&self, task: &ConversionTask) -> Result<String> {
        let bytes = tokio::fs::read(&task.source_path)
            .await
            .map_err(|e| KbError::io(&task.source_path, e))?;

        let submission = self
            .api
            .submit(&[SubmitFile {
                name: task.file_name.clone(),
                data_id: task.id.clone(),
            }])
            .await?;
        let upload_url = submission.upload_urls.first().ok_or_else(|| {
            KbError::RemoteRejected(format!("batch {} has no upload URL", submission.batch_id))
        })?;

        self.api.upload(upload_url, bytes).await?;
        Ok(submission.batch_id)
    }

    /// Copy a markdown source into the output layout. Returns `false` if the
    /// copy already existed.
    fn copy_markdown(&self, task: &ConversionTask) -> Result<bool> {
        let target = self.layout.copy_path(&task.relative_dir, &task.file_name);
        if target.exists() {
            return Ok(false);
        }
        copy_file(&task.source_path, &target)?;
        debug!(path = %target.display(), "copied markdown source");
        Ok(true)
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KbError::io(parent, e))?;
    }
    std::fs::copy(from, to).map_err(|e| KbError::io(from, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::testing::{ScriptedBatchApi, temp_dir};
    use kbforge_storage::JsonTaskStore;

    struct Fixture {
        raw: PathBuf,
        out: PathBuf,
        store: JsonTaskStore,
        manifest: SourceManifest,
    }

    fn fixture() -> Fixture {
        let root = temp_dir();
        let raw = root.join("raw");
        let out = root.join("out");
        std::fs::create_dir_all(raw.join("laws")).unwrap();
        std::fs::write(raw.join("laws").join("a.pdf"), b"%PDF a").unwrap();
        std::fs::write(raw.join("b.pdf"), b"%PDF b").unwrap();
        std::fs::write(raw.join("laws").join("notes.md"), "# Notes").unwrap();

        let mut manifest = SourceManifest::new();
        for (id, rel) in [("u-a", "laws/a.pdf"), ("u-b", "b.pdf"), ("u-md", "laws/notes.md")] {
            let path = raw.join(rel);
            manifest.insert(
                id.into(),
                SourceEntry {
                    file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
                    absolute_path: path,
                    relative_path: None,
                },
            );
        }

        let store = JsonTaskStore::open(&root.join("tasks.json")).unwrap();
        Fixture {
            raw,
            out,
            store,
            manifest,
        }
    }

    #[tokio::test]
    async fn submits_uploads_and_copies_markdown() {
        let f = fixture();
        let api = ScriptedBatchApi::submit_only();
        let submitter = Submitter::new(&api, &f.store, &f.raw, OutputLayout::new(&f.out));

        let report = submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.markdown_copied, 1);
        assert!(report.failed.is_empty());

        assert_eq!(api.submissions.lock().unwrap().len(), 2);
        assert_eq!(api.uploads.lock().unwrap().len(), 2);
        assert!(f.out.join("laws").join("notes.md").exists());

        let a = f.store.get("u-a").await.unwrap().unwrap();
        assert!(matches!(a.state, TaskState::Submitted { .. }));
        assert_eq!(f.store.list_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rerun_does_not_resubmit() {
        let f = fixture();
        let api = ScriptedBatchApi::submit_only();
        let submitter = Submitter::new(&api, &f.store, &f.raw, OutputLayout::new(&f.out));

        submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();
        let report = submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();

        assert_eq!(report.submitted, 0);
        assert_eq!(report.already_tracked, 2);
        assert_eq!(report.markdown_present, 1);
        assert_eq!(api.submissions.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn existing_archive_marks_done_without_remote_call() {
        let f = fixture();
        std::fs::create_dir_all(f.out.join("laws")).unwrap();
        std::fs::write(f.out.join("laws").join("a.zip"), "zip").unwrap();

        let api = ScriptedBatchApi::submit_only();
        let submitter = Submitter::new(&api, &f.store, &f.raw, OutputLayout::new(&f.out));
        let report = submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();

        assert_eq!(report.already_materialized, 1);
        assert_eq!(report.submitted, 1);
        let a = f.store.get("u-a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::Done { batch_id: None });
    }

    fn add_source(f: &mut Fixture, id: &str, rel: &str) {
        let path = f.raw.join(rel);
        std::fs::write(&path, b"bytes").unwrap();
        f.manifest.insert(
            id.into(),
            SourceEntry {
                file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
                absolute_path: path,
                relative_path: None,
            },
        );
    }

    #[tokio::test]
    async fn same_stem_sources_do_not_share_an_archive() {
        let mut f = fixture();
        add_source(&mut f, "u-a2", "laws/a.docx");
        std::fs::create_dir_all(f.out.join("laws")).unwrap();
        std::fs::write(f.out.join("laws").join("a.zip"), "zip").unwrap();

        let api = ScriptedBatchApi::submit_only();
        let submitter = Submitter::new(&api, &f.store, &f.raw, OutputLayout::new(&f.out));
        let report = submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();

        // u-a owns laws/a.zip; u-a2 is neither marked done nor submitted.
        assert_eq!(report.already_materialized, 1);
        assert_eq!(report.submitted, 1);
        assert_eq!(report.output_conflicts, vec![("u-a2".to_string(), "u-a".to_string())]);
        let a = f.store.get("u-a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::Done { batch_id: None });
        let a2 = f.store.get("u-a2").await.unwrap().unwrap();
        assert_eq!(a2.state, TaskState::Pending);
        let submitted: Vec<String> = api
            .submissions
            .lock()
            .unwrap()
            .iter()
            .map(|file| file.data_id.clone())
            .collect();
        assert_eq!(submitted, vec!["u-b".to_string()]);
    }

    #[tokio::test]
    async fn markdown_source_owns_its_name_over_a_converted_source() {
        let mut f = fixture();
        add_source(&mut f, "u-0", "b.md");

        let api = ScriptedBatchApi::submit_only();
        let submitter = Submitter::new(&api, &f.store, &f.raw, OutputLayout::new(&f.out));
        let report = submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();

        assert_eq!(report.markdown_copied, 2);
        assert_eq!(report.submitted, 1);
        assert_eq!(report.output_conflicts, vec![("u-b".to_string(), "u-0".to_string())]);
        assert_eq!(f.store.get("u-b").await.unwrap().unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn failed_submission_stays_pending_and_retries() {
        let f = fixture();
        let mut api = ScriptedBatchApi::submit_only();
        api.reject_submit.insert("u-a".into());
        api.reject_upload.insert("u-b".into());
        let submitter = Submitter::new(&api, &f.store, &f.raw, OutputLayout::new(&f.out));

        let report = submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();
        assert_eq!(report.submitted, 0);
        assert_eq!(report.failed.len(), 2);
        for id in ["u-a", "u-b"] {
            assert_eq!(f.store.get(id).await.unwrap().unwrap().state, TaskState::Pending);
        }

        let api = ScriptedBatchApi::submit_only();
        let submitter = Submitter::new(&api, &f.store, &f.raw, OutputLayout::new(&f.out));
        let report = submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();
        assert_eq!(report.submitted, 2);
    }

    #[tokio::test]
    async fn missing_raw_file_is_reported() {
        let f = fixture();
        std::fs::remove_file(f.raw.join("b.pdf")).unwrap();
        let api = ScriptedBatchApi::submit_only();
        let submitter = Submitter::new(&api, &f.store, &f.raw, OutputLayout::new(&f.out));

        let report = submitter.submit_all(&f.manifest, &SilentProgress).await.unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(report.failed[0].0, "u-b");
    }
}
