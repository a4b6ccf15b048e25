//! Entity/relationship extraction from text.
//!
//! [`GraphExtractor`] is the seam the graph build pipeline calls once per
//! source unit. [`ChatGraphExtractor`] implements it against any
//! OpenAI-compatible `chat/completions` endpoint (ZhipuAI GLM by default).

mod parse;
mod prompt;

use std::time::Duration;

use async_trait::async_trait;
use kbforge_shared::{ExtractedGraph, ExtractionConfig, KbError, Result};
use reqwest::Client;
use serde_json::json;
use tracing::{debug, instrument};

/// User-Agent string for extraction requests.
const USER_AGENT: &str = concat!("kbforge/", env!("CARGO_PKG_VERSION"));

/// Turns a piece of text into candidate nodes and relationships.
#[async_trait]
pub trait GraphExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<ExtractedGraph>;

    /// Model identifier recorded in checkpoints.
    fn model(&self) -> Option<&str> {
        None
    }
}

/// Connection settings for [`ChatGraphExtractor`].
#[derive(Debug, Clone)]
pub struct ChatExtractorOptions {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl ChatExtractorOptions {
    pub fn from_config(config: &ExtractionConfig, api_key: impl Into<String>) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        }
    }
}

/// [`GraphExtractor`] backed by a chat-completions model.
pub struct ChatGraphExtractor {
    http: Client,
    opts: ChatExtractorOptions,
}

impl ChatGraphExtractor {
    pub fn new(opts: ChatExtractorOptions) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(opts.timeout_secs))
            .build()
            .map_err(|e| KbError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, opts })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.opts.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl GraphExtractor for ChatGraphExtractor {
    #[instrument(skip_all, fields(model = %self.opts.model, chars = text.chars().count()))]
    async fn extract(&self, text: &str) -> Result<ExtractedGraph> {
        let url = self.endpoint();
        let request = json!({
            "model": self.opts.model,
            "temperature": self.opts.temperature,
            "messages": [
                {"role": "system", "content": prompt::SYSTEM_PROMPT},
                {"role": "user", "content": prompt::user_prompt(text)},
            ],
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.opts.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| KbError::Extraction(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KbError::Extraction(format!(
                "{url}: HTTP {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| KbError::Extraction(format!("{url}: invalid response: {e}")))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| KbError::Extraction("response has no message content".into()))?;

        let graph = parse::parse_graph_response(content)?;
        debug!(
            nodes = graph.nodes.len(),
            relationships = graph.relationships.len(),
            "extracted graph"
        );
        Ok(graph)
    }

    fn model(&self) -> Option<&str> {
        Some(&self.opts.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn extractor(server: &MockServer) -> ChatGraphExtractor {
        ChatGraphExtractor::new(ChatExtractorOptions {
            base_url: format!("{}/api/paas/v4/", server.uri()),
            api_key: "zk-test".into(),
            model: "glm-4-long".into(),
            temperature: 0.0,
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn completion(content: &str) -> serde_json::Value {
        json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        })
    }

    #[tokio::test]
    async fn extract_posts_chat_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/paas/v4/chat/completions"))
            .and(header("authorization", "Bearer zk-test"))
            .and(body_partial_json(json!({"model": "glm-4-long", "temperature": 0.0})))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                "```json\n{\"nodes\": [{\"id\": \"Alice\", \"type\": \"Person\"}], \"relationships\": []}\n```",
            )))
            .expect(1)
            .mount(&server)
            .await;

        let ex = extractor(&server);
        let graph = ex.extract("Alice is a person.").await.unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].id, "Alice");
        assert_eq!(ex.model(), Some("glm-4-long"));
    }

    #[tokio::test]
    async fn http_error_is_extraction_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = extractor(&server).extract("text").await.unwrap_err();
        assert!(matches!(err, KbError::Extraction(_)));
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn missing_content_is_extraction_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = extractor(&server).extract("text").await.unwrap_err();
        assert!(err.to_string().contains("no message content"));
    }
}
