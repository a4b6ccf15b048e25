//! Conversion-task domain types: source metadata, the task record, and the
//! task state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};

// ---------------------------------------------------------------------------
// Source metadata (written by the external scanner)
// ---------------------------------------------------------------------------

/// One entry of `metadata.json`, keyed by the file's UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Original file name, including extension.
    pub file_name: String,
    /// Absolute path of the raw file.
    pub absolute_path: PathBuf,
    /// Path relative to the project root (forward slashes).
    #[serde(default)]
    pub relative_path: Option<String>,
}

impl SourceEntry {
    /// Markdown sources skip remote conversion.
    pub fn is_markdown(&self) -> bool {
        self.absolute_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
    }
}

/// The whole `metadata.json` document. Ordered by identity for stable iteration.
pub type SourceManifest = BTreeMap<String, SourceEntry>;

/// Load `metadata.json`. Unknown keys inside entries are ignored.
pub fn load_source_manifest(path: &Path) -> Result<SourceManifest> {
    let content = std::fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| KbError::parse(format!("invalid metadata file {}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// TaskState / TaskEvent
// ---------------------------------------------------------------------------

/// Lifecycle of a conversion task.
///
/// The batch id is carried by the state itself, so a task can never hold
/// more than one active batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskState {
    /// Known locally, not yet accepted by the batch service.
    Pending,
    /// Uploaded; the batch service returned `batch_id`.
    Submitted { batch_id: String },
    /// Status has been queried at least once and was not terminal.
    Polling { batch_id: String },
    /// Result materialized at its final path.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_id: Option<String>,
    },
    /// The batch service reported a terminal failure.
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_id: Option<String>,
        error: String,
    },
}

/// Something that happened to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// The batch service accepted the upload.
    Submitted { batch_id: String },
    /// A status query returned a non-terminal state.
    Queried,
    /// The result was materialized.
    Completed,
    /// The batch service reported `failed` or `error`.
    RemoteFailed { error: String },
    /// The target artifact already exists; no remote work needed.
    AlreadyMaterialized,
}

impl TaskState {
    /// Stable lowercase name, used as the persisted status column.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted { .. } => "submitted",
            Self::Polling { .. } => "polling",
            Self::Done { .. } => "done",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn batch_id(&self) -> Option<&str> {
        match self {
            Self::Pending => None,
            Self::Submitted { batch_id } | Self::Polling { batch_id } => Some(batch_id),
            Self::Done { batch_id } | Self::Failed { batch_id, .. } => batch_id.as_deref(),
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Submitted or Polling: the task is waiting on the batch service.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Submitted { .. } | Self::Polling { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Failed { .. })
    }

    /// Compute the next state, or `None` if `event` is not allowed here.
    pub fn apply(&self, event: &TaskEvent) -> Option<TaskState> {
        use TaskEvent as E;
        use TaskState as S;

        match (self, event) {
            (S::Pending, E::Submitted { batch_id }) => Some(S::Submitted {
                batch_id: batch_id.clone(),
            }),
            (S::Pending, E::AlreadyMaterialized) => Some(S::Done { batch_id: None }),
            (S::Submitted { batch_id } | S::Polling { batch_id }, E::Queried) => {
                Some(S::Polling {
                    batch_id: batch_id.clone(),
                })
            }
            // Terminal outcomes are only observed through a query.
            (S::Polling { batch_id }, E::Completed) => Some(S::Done {
                batch_id: Some(batch_id.clone()),
            }),
            (S::Polling { batch_id }, E::RemoteFailed { error }) => {
                Some(S::Failed {
                    batch_id: Some(batch_id.clone()),
                    error: error.clone(),
                })
            }
            _ => None,
        }
    }

    /// Rebuild a state from its persisted columns.
    pub fn from_parts(
        status: &str,
        batch_id: Option<String>,
        error: Option<String>,
    ) -> Result<Self> {
        let require_batch = |batch_id: Option<String>| {
            batch_id.ok_or_else(|| KbError::validation(format!("status '{status}' without batch_id")))
        };

        match status {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted {
                batch_id: require_batch(batch_id)?,
            }),
            "polling" => Ok(Self::Polling {
                batch_id: require_batch(batch_id)?,
            }),
            "done" => Ok(Self::Done { batch_id }),
            "failed" => Ok(Self::Failed {
                batch_id,
                error: error.unwrap_or_default(),
            }),
            other => Err(KbError::validation(format!("unknown task status '{other}'"))),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted { batch_id } => write!(f, "submitted({batch_id})"),
            Self::Queried => f.write_str("queried"),
            Self::Completed => f.write_str("completed"),
            Self::RemoteFailed { .. } => f.write_str("remote_failed"),
            Self::AlreadyMaterialized => f.write_str("already_materialized"),
        }
    }
}

// ---------------------------------------------------------------------------
// ConversionTask
// ---------------------------------------------------------------------------

/// A raw artifact travelling through remote conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionTask {
    /// Artifact identity (the UUID from `metadata.json`); also the remote `data_id`.
    pub id: String,
    /// Original file name.
    pub file_name: String,
    /// Absolute path of the raw file.
    pub source_path: PathBuf,
    /// Directory of the raw file relative to the raw-files root.
    pub relative_dir: PathBuf,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Last time the state changed.
    pub updated_at: DateTime<Utc>,
}

impl ConversionTask {
    /// Create a `Pending` task for a source entry found under `raw_root`.
    pub fn from_source(id: impl Into<String>, entry: &SourceEntry, raw_root: &Path) -> Self {
        let relative_dir = entry
            .absolute_path
            .strip_prefix(raw_root)
            .ok()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self {
            id: id.into(),
            file_name: entry.file_name.clone(),
            source_path: entry.absolute_path.clone(),
            relative_dir,
            state: TaskState::Pending,
            updated_at: Utc::now(),
        }
    }

    /// File name without its final extension (`report.v2.pdf` -> `report.v2`).
    pub fn file_stem(&self) -> String {
        Path::new(&self.file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file_name.clone())
    }

    /// Advance the state machine, rejecting illegal transitions.
    pub fn apply(&mut self, event: TaskEvent) -> Result<()> {
        match self.state.apply(&event) {
            Some(next) => {
                self.state = next;
                self.updated_at = Utc::now();
                Ok(())
            }
            None => Err(KbError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.state.to_string(),
                event: event.to_string(),
            }),
        }
    }
}
