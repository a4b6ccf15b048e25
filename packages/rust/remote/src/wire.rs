//! JSON shapes of the batch conversion API.

use serde::{Deserialize, Serialize};

/// Every response is wrapped as `{code, msg, data}`; `code == 0` means success.
#[derive(Debug, Deserialize)]
pub(crate) struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitBody<'a> {
    pub enable_formula: bool,
    pub enable_table: bool,
    pub language: &'a str,
    pub files: Vec<SubmitFileBody<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct SubmitFileBody<'a> {
    pub name: &'a str,
    pub is_ocr: bool,
    pub data_id: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SubmitData {
    pub batch_id: String,
    #[serde(default)]
    pub file_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatusData {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub extract_result: Vec<ExtractResultBody>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExtractResultBody {
    #[serde(default)]
    pub data_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    pub state: String,
    #[serde(default)]
    pub full_zip_url: Option<String>,
    #[serde(default)]
    pub err_msg: Option<String>,
}
