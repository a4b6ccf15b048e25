//! Application configuration for kbforge.
//!
//! User config lives at `~/.kbforge/kbforge.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "kbforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".kbforge";

// ---------------------------------------------------------------------------
// Config structs (matching kbforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Knowledge base directory layout.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Remote batch conversion service.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Status polling cadence.
    #[serde(default)]
    pub polling: PollingConfig,

    /// LLM graph extraction.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Graph store loading.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Task metadata persistence.
    #[serde(default)]
    pub tasks: TasksConfig,
}

/// `[paths]` section. Unset directories are derived from `knowledge_base`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the knowledge base tree.
    #[serde(default = "default_knowledge_base")]
    pub knowledge_base: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converted_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_db: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_db: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            knowledge_base: default_knowledge_base(),
            raw_dir: None,
            converted_dir: None,
            metadata_file: None,
            chunks_dir: None,
            checkpoint_dir: None,
            state_db: None,
            graph_db: None,
        }
    }
}

fn default_knowledge_base() -> PathBuf {
    PathBuf::from("knowledge_base")
}

impl PathsConfig {
    fn resolve(&self, explicit: &Option<PathBuf>, default: &[&str]) -> PathBuf {
        explicit.clone().unwrap_or_else(|| {
            default
                .iter()
                .fold(self.knowledge_base.clone(), |acc, part| acc.join(part))
        })
    }

    /// Raw input files (`01_raw_files`).
    pub fn raw_dir(&self) -> PathBuf {
        self.resolve(&self.raw_dir, &["01_raw_files"])
    }

    /// Converted output mirror (`02_raw_md_files`).
    pub fn converted_dir(&self) -> PathBuf {
        self.resolve(&self.converted_dir, &["02_raw_md_files"])
    }

    /// Source metadata written by the scanner.
    pub fn metadata_file(&self) -> PathBuf {
        self.resolve(&self.metadata_file, &["metadata.json"])
    }

    /// Split documents, one file per extraction unit.
    pub fn chunks_dir(&self) -> PathBuf {
        self.resolve(&self.chunks_dir, &["04_database", "01_split_documents"])
    }

    /// Graph extraction checkpoints.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.resolve(&self.checkpoint_dir, &["04_database", "02_graph_checkpoints"])
    }

    /// Task state database (libSQL) or JSON file, depending on `[tasks] store`.
    pub fn state_db(&self) -> PathBuf {
        self.resolve(&self.state_db, &["04_database", "kbforge.db"])
    }

    /// Graph database.
    pub fn graph_db(&self) -> PathBuf {
        self.resolve(&self.graph_db, &["04_database", "03_graph.db"])
    }
}

/// `[remote]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// API root, e.g. `https://mineru.net/api/v4`.
    #[serde(default = "default_remote_base_url")]
    pub base_url: String,

    /// Name of the env var holding the bearer token (never store the token itself).
    #[serde(default = "default_remote_key_env")]
    pub api_key_env: String,

    /// Document language hint.
    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_true")]
    pub enable_formula: bool,

    #[serde(default = "default_true")]
    pub enable_table: bool,

    #[serde(default = "default_true")]
    pub is_ocr: bool,

    /// Per-request timeout.
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_remote_base_url(),
            api_key_env: default_remote_key_env(),
            language: default_language(),
            enable_formula: true,
            enable_table: true,
            is_ocr: true,
            timeout_secs: default_remote_timeout(),
        }
    }
}

fn default_remote_base_url() -> String {
    "https://mineru.net/api/v4".into()
}
fn default_remote_key_env() -> String {
    "MINERU_API_TOKEN".into()
}
fn default_language() -> String {
    "ch".into()
}
fn default_true() -> bool {
    true
}
fn default_remote_timeout() -> u64 {
    120
}

/// `[polling]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Wait between cycles while progress is being made.
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,

    /// Upper bound for the backed-off wait.
    #[serde(default = "default_poll_max_interval")]
    pub max_interval_secs: u64,

    /// Multiplier applied after a cycle with no state change.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Stop polling after this many seconds (tasks stay persisted).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            max_interval_secs: default_poll_max_interval(),
            backoff_factor: default_backoff_factor(),
            deadline_secs: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    10
}
fn default_poll_max_interval() -> u64 {
    60
}
fn default_backoff_factor() -> f64 {
    2.0
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// OpenAI-compatible API root.
    #[serde(default = "default_extraction_base_url")]
    pub base_url: String,

    /// Chat model used for graph extraction.
    #[serde(default = "default_extraction_model")]
    pub model: String,

    /// Name of the env var holding the API key.
    #[serde(default = "default_extraction_key_env")]
    pub api_key_env: String,

    #[serde(default)]
    pub temperature: f32,

    /// Per-request timeout; long units can take minutes.
    #[serde(default = "default_extraction_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            base_url: default_extraction_base_url(),
            model: default_extraction_model(),
            api_key_env: default_extraction_key_env(),
            temperature: 0.0,
            timeout_secs: default_extraction_timeout(),
        }
    }
}

fn default_extraction_base_url() -> String {
    "https://open.bigmodel.cn/api/paas/v4".into()
}
fn default_extraction_model() -> String {
    "glm-4-long".into()
}
fn default_extraction_key_env() -> String {
    "ZHIPUAI_API_KEY".into()
}
fn default_extraction_timeout() -> u64 {
    300
}

/// Conflict policy for nodes defined by more than one checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicyKind {
    #[default]
    FirstWins,
    LastWins,
    MergeProperties,
}

/// `[graph]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Items (nodes + relationships) per store write.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batches.
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,

    /// Tries per batch before it is logged as failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between tries of the same batch.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    #[serde(default)]
    pub merge_policy: MergePolicyKind,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay(),
            merge_policy: MergePolicyKind::default(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_batch_delay() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    1
}
fn default_retry_delay() -> u64 {
    2_000
}

/// Backend for the conversion task store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStoreKind {
    #[default]
    Sqlite,
    Json,
}

/// `[tasks]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksConfig {
    #[serde(default)]
    pub store: TaskStoreKind,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.kbforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| KbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.kbforge/kbforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| KbError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| KbError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| KbError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| KbError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| KbError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

impl AppConfig {
    /// Reject values that would make a run loop forever or never write.
    pub fn validate(&self) -> Result<()> {
        if self.graph.batch_size == 0 {
            return Err(KbError::config("graph.batch_size must be at least 1"));
        }
        if self.graph.max_attempts == 0 {
            return Err(KbError::config("graph.max_attempts must be at least 1"));
        }
        if self.polling.backoff_factor < 1.0 {
            return Err(KbError::config("polling.backoff_factor must be >= 1.0"));
        }
        if self.polling.max_interval_secs < self.polling.interval_secs {
            return Err(KbError::config(
                "polling.max_interval_secs must be >= polling.interval_secs",
            ));
        }
        Ok(())
    }
}

/// Read an API key from the env var named `var_name`.
pub fn resolve_api_key(var_name: &str, service: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(KbError::config(format!(
            "{service} API key not found. Set the {var_name} environment variable."
        ))),
    }
}
