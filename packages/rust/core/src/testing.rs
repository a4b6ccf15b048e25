//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use kbforge_extract::GraphExtractor;
use kbforge_remote::{BatchApi, BatchStatus, BatchSubmission, RemoteResult, RemoteState, SubmitFile};
use kbforge_shared::{ConversionTask, ExtractedGraph, KbError, Result, SourceEntry};
use kbforge_storage::{GraphBatch, GraphStore};
use uuid::Uuid;

pub fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("kbf_core_{}", Uuid::now_v7()))
}

/// An in-memory zip archive holding `(name, body)` entries.
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, body) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A pending task whose raw file sits at `<raw>/<relative_dir>/<file_name>`.
pub fn task_in(id: &str, relative_dir: &str, file_name: &str) -> ConversionTask {
    let raw = Path::new("/kb/raw");
    let entry = SourceEntry {
        file_name: file_name.into(),
        absolute_path: raw.join(relative_dir).join(file_name),
        relative_path: None,
    };
    ConversionTask::from_source(id, &entry, raw)
}

pub fn result(data_id: &str, state: RemoteState) -> RemoteResult {
    RemoteResult {
        data_id: data_id.into(),
        file_name: None,
        state,
    }
}

type StatusScript = Box<dyn Fn(&str, u32) -> Result<BatchStatus> + Send + Sync>;

/// Batch API whose status responses come from a script of `(batch_id, call_no)`.
pub struct ScriptedBatchApi {
    script: StatusScript,
    status_calls: Mutex<HashMap<String, u32>>,
    pub submissions: Mutex<Vec<SubmitFile>>,
    pub uploads: Mutex<Vec<(String, usize)>>,
    pub reject_submit: HashSet<String>,
    pub reject_upload: HashSet<String>,
    next_batch: AtomicUsize,
}

impl ScriptedBatchApi {
    pub fn new(script: impl Fn(&str, u32) -> Result<BatchStatus> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            status_calls: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            reject_submit: HashSet::new(),
            reject_upload: HashSet::new(),
            next_batch: AtomicUsize::new(1),
        }
    }

    /// A status script that is never expected to be called.
    pub fn submit_only() -> Self {
        Self::new(|batch, _| Err(KbError::TransientNetwork(format!("unexpected status {batch}"))))
    }

    pub fn status_calls(&self, batch_id: &str) -> u32 {
        self.status_calls
            .lock()
            .unwrap()
            .get(batch_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_status_calls(&self) -> u32 {
        self.status_calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl BatchApi for ScriptedBatchApi {
    async fn submit(&self, files: &[SubmitFile]) -> Result<BatchSubmission> {
        if files.iter().any(|f| self.reject_submit.contains(&f.data_id)) {
            return Err(KbError::RemoteRejected("quota exceeded".into()));
        }
        self.submissions.lock().unwrap().extend(files.iter().cloned());
        let n = self.next_batch.fetch_add(1, Ordering::SeqCst);
        Ok(BatchSubmission {
            batch_id: format!("batch-{n}"),
            upload_urls: files
                .iter()
                .map(|f| format!("mock://upload/{}", f.data_id))
                .collect(),
        })
    }

    async fn upload(&self, upload_url: &str, body: Vec<u8>) -> Result<()> {
        let data_id = upload_url.rsplit('/').next().unwrap_or_default();
        if self.reject_upload.contains(data_id) {
            return Err(KbError::TransientNetwork("upload reset".into()));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((upload_url.to_string(), body.len()));
        Ok(())
    }

    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let call = {
            let mut calls = self.status_calls.lock().unwrap();
            let n = calls.entry(batch_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        (self.script)(batch_id, call)
    }
}

type ExtractScript = Box<dyn Fn(&str) -> Result<ExtractedGraph> + Send + Sync>;

/// Extractor driven by a closure over the unit text; counts calls.
pub struct ScriptedExtractor {
    script: ExtractScript,
    calls: AtomicUsize,
}

impl ScriptedExtractor {
    pub fn new(script: impl Fn(&str) -> Result<ExtractedGraph> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphExtractor for ScriptedExtractor {
    async fn extract(&self, text: &str) -> Result<ExtractedGraph> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(text)
    }

    fn model(&self) -> Option<&str> {
        Some("scripted")
    }
}

/// Graph store that records every call and fails the listed call indices.
#[derive(Default)]
pub struct RecordingGraphStore {
    pub fail_calls: HashSet<usize>,
    calls: AtomicUsize,
    pub written: Mutex<Vec<GraphBatch>>,
}

impl RecordingGraphStore {
    pub fn failing(calls: impl IntoIterator<Item = usize>) -> Self {
        Self {
            fail_calls: calls.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphStore for RecordingGraphStore {
    async fn write_batch(&self, batch: &GraphBatch) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_calls.contains(&call) {
            return Err(KbError::WriteBatch(format!("call {call} refused")));
        }
        self.written.lock().unwrap().push(batch.clone());
        Ok(())
    }
}
