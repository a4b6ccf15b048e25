//! Client for the remote batch document-conversion service (MinerU API).
//!
//! Three calls make up the protocol:
//! 1. `POST {base}/file-urls/batch` creates a batch and returns pre-signed upload URLs
//! 2. `PUT <upload url>` uploads the raw bytes
//! 3. `GET {base}/extract-results/batch/{batch_id}` reports per-file state
//!
//! Result archives are downloaded separately from `full_zip_url`.

mod wire;

use std::time::Duration;

use async_trait::async_trait;
use kbforge_shared::{KbError, RemoteConfig, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

/// User-Agent string for all outgoing requests.
const USER_AGENT: &str = concat!("kbforge/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// One file to include in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitFile {
    pub name: String,
    /// Our artifact identity; echoed back as `data_id` in status responses.
    pub data_id: String,
}

/// A batch accepted by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSubmission {
    pub batch_id: String,
    /// Upload URLs, in the same order as the submitted files.
    pub upload_urls: Vec<String>,
}

/// Remote processing state of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    /// Finished; the result archive is at `zip_url`.
    Done { zip_url: String },
    /// `failed` or `error`.
    Failed { error: String },
    /// Any other state (`pending`, `running`, `converting`, `waiting-file`, ...).
    InProgress(String),
}

impl RemoteState {
    fn from_body(body: &wire::ExtractResultBody) -> Self {
        match body.state.as_str() {
            "done" => match &body.full_zip_url {
                Some(url) if !url.is_empty() => Self::Done {
                    zip_url: url.clone(),
                },
                _ => {
                    warn!(data_id = ?body.data_id, "state done without full_zip_url");
                    Self::InProgress("done".into())
                }
            },
            "failed" | "error" => Self::Failed {
                error: body
                    .err_msg
                    .clone()
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("remote state '{}'", body.state)),
            },
            other => Self::InProgress(other.to_string()),
        }
    }
}

/// Per-file result inside a batch status response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResult {
    pub data_id: String,
    pub file_name: Option<String>,
    pub state: RemoteState,
}

/// Status of every file in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    pub batch_id: String,
    pub results: Vec<RemoteResult>,
}

impl BatchStatus {
    /// Find the entry for one of our artifacts.
    pub fn result_for(&self, data_id: &str) -> Option<&RemoteResult> {
        self.results.iter().find(|r| r.data_id == data_id)
    }
}

// ---------------------------------------------------------------------------
// BatchApi
// ---------------------------------------------------------------------------

/// The batch service as seen by the pipeline.
#[async_trait]
pub trait BatchApi: Send + Sync {
    /// Create a batch for `files`.
    async fn submit(&self, files: &[SubmitFile]) -> Result<BatchSubmission>;

    /// Upload raw bytes to a pre-signed URL returned by [`BatchApi::submit`].
    async fn upload(&self, upload_url: &str, body: Vec<u8>) -> Result<()>;

    /// Query the state of every file in a batch.
    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Options for [`MineruClient`].
#[derive(Debug, Clone)]
pub struct BatchClientOptions {
    pub base_url: String,
    pub token: String,
    pub language: String,
    pub enable_formula: bool,
    pub enable_table: bool,
    pub is_ocr: bool,
    pub timeout_secs: u64,
}

impl BatchClientOptions {
    pub fn from_config(config: &RemoteConfig, token: impl Into<String>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            language: config.language.clone(),
            enable_formula: config.enable_formula,
            enable_table: config.enable_table,
            is_ocr: config.is_ocr,
            timeout_secs: config.timeout_secs,
        }
    }
}

/// reqwest-backed [`BatchApi`].
pub struct MineruClient {
    http: Client,
    opts: BatchClientOptions,
}

impl MineruClient {
    pub fn new(opts: BatchClientOptions) -> Result<Self> {
        Ok(Self {
            http: build_http_client(opts.timeout_secs)?,
            opts,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.opts.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl BatchApi for MineruClient {
    #[instrument(skip_all, fields(files = files.len()))]
    async fn submit(&self, files: &[SubmitFile]) -> Result<BatchSubmission> {
        let url = self.endpoint("file-urls/batch");
        let body = wire::SubmitBody {
            enable_formula: self.opts.enable_formula,
            enable_table: self.opts.enable_table,
            language: &self.opts.language,
            files: files
                .iter()
                .map(|f| wire::SubmitFileBody {
                    name: &f.name,
                    is_ocr: self.opts.is_ocr,
                    data_id: &f.data_id,
                })
                .collect(),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.opts.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| KbError::TransientNetwork(format!("{url}: {e}")))?;

        let data: wire::SubmitData = read_envelope(&url, response).await?;
        if data.file_urls.len() < files.len() {
            return Err(KbError::RemoteRejected(format!(
                "batch {} returned {} upload URLs for {} files",
                data.batch_id,
                data.file_urls.len(),
                files.len()
            )));
        }

        debug!(batch_id = %data.batch_id, "batch created");
        Ok(BatchSubmission {
            batch_id: data.batch_id,
            upload_urls: data.file_urls,
        })
    }

    async fn upload(&self, upload_url: &str, body: Vec<u8>) -> Result<()> {
        let size = body.len();
        // Pre-signed URLs carry their own auth; no bearer header.
        let response = self
            .http
            .put(upload_url)
            .body(body)
            .send()
            .await
            .map_err(|e| KbError::TransientNetwork(format!("upload: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("upload", status));
        }
        debug!(bytes = size, "upload complete");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let url = self.endpoint(&format!("extract-results/batch/{batch_id}"));
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.opts.token)
            .send()
            .await
            .map_err(|e| KbError::TransientNetwork(format!("{url}: {e}")))?;

        let data: wire::StatusData = read_envelope(&url, response).await?;
        let results = data
            .extract_result
            .iter()
            .filter_map(|body| {
                let data_id = body.data_id.clone()?;
                Some(RemoteResult {
                    data_id,
                    file_name: body.file_name.clone(),
                    state: RemoteState::from_body(body),
                })
            })
            .collect();

        Ok(BatchStatus {
            batch_id: data.batch_id.unwrap_or_else(|| batch_id.to_string()),
            results,
        })
    }
}

/// Build a reqwest client with the shared settings.
pub fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| KbError::config(format!("failed to build HTTP client: {e}")))
}

/// Server errors and throttling are worth retrying; other statuses are rejections.
fn classify_status(what: &str, status: StatusCode) -> KbError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        KbError::TransientNetwork(format!("{what}: HTTP {status}"))
    } else {
        KbError::RemoteRejected(format!("{what}: HTTP {status}"))
    }
}

/// Check the HTTP status, decode the envelope, and unwrap `data`.
async fn read_envelope<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(classify_status(url, status));
    }

    let text = response
        .text()
        .await
        .map_err(|e| KbError::TransientNetwork(format!("{url}: failed to read body: {e}")))?;
    let envelope: wire::Envelope<T> = serde_json::from_str(&text)
        .map_err(|e| KbError::parse(format!("{url}: invalid response: {e}")))?;

    if envelope.code != 0 {
        return Err(KbError::RemoteRejected(format!(
            "code {}: {}",
            envelope.code, envelope.msg
        )));
    }
    envelope
        .data
        .ok_or_else(|| KbError::parse(format!("{url}: response has no data")))
}
