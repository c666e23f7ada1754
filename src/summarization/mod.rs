//! Abstractions for generating document summaries via a hosted generative model.
//!
//! The summarize stage depends on [`SummarizationClient`]; [`GeminiClient`] implements it by
//! calling the Gemini `generateContent` endpoint directly over HTTP.

use crate::config::GenAiSettings;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Instruction prepended to the document text.
pub const SUMMARY_PROMPT: &str = "Write a short, precise summary (at most 6 bullet points, in the original language) of the following text:\n\n";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors surfaced while attempting summarization.
#[derive(Debug, Error)]
pub enum SummarizationClientError {
    /// Provider is not configured or could not be reached.
    #[error("Summarization provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// Provider returned an error response.
    #[error("Failed to generate summary: {0}")]
    GenerationFailed(String),
    /// Provider response could not be parsed.
    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

/// A generated summary together with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Summary text, trimmed.
    pub summary: String,
    /// Model that produced it.
    pub model: String,
    /// Wall-clock time spent in the provider call.
    pub elapsed_ms: i32,
}

/// Interface implemented by summarization providers.
#[async_trait]
pub trait SummarizationClient: Send + Sync {
    /// Model identifier reported alongside results.
    fn model(&self) -> &str;

    /// Summarize `text`.
    async fn summarize(&self, text: &str) -> Result<Summary, SummarizationClientError>;
}

/// Gemini `generateContent` client.
pub struct GeminiClient {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiClient {
    /// Build a client from settings. Fails when no API key is configured.
    pub fn new(settings: &GenAiSettings) -> Result<Self, SummarizationClientError> {
        let api_key = settings
            .require_api_key()
            .map_err(|error| SummarizationClientError::ProviderUnavailable(error.to_string()))?
            .to_string();
        let http = Client::builder()
            .user_agent("dms-pipeline/summary")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| SummarizationClientError::ProviderUnavailable(error.to_string()))?;
        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
            api_key,
        })
    }

    fn endpoint(&self) -> Result<Url, SummarizationClientError> {
        let raw = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let mut url = Url::parse(&raw).map_err(|error| {
            SummarizationClientError::ProviderUnavailable(format!("invalid Gemini URL {raw}: {error}"))
        })?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateContentResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .next()?
            .text
    }
}

#[async_trait]
impl SummarizationClient for GeminiClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn summarize(&self, text: &str) -> Result<Summary, SummarizationClientError> {
        let payload = json!({
            "contents": [{
                "parts": [{ "text": format!("{SUMMARY_PROMPT}{text}") }]
            }]
        });

        let started = Instant::now();
        let response = self
            .http
            .post(self.endpoint()?)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                SummarizationClientError::ProviderUnavailable(format!(
                    "failed to reach Gemini at {}: {}",
                    self.base_url,
                    error.without_url()
                ))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SummarizationClientError::GenerationFailed(format!(
                "Gemini returned {status}: {body}"
            )));
        }

        let body = response.bytes().await.map_err(|error| {
            SummarizationClientError::ProviderUnavailable(format!(
                "reading Gemini response failed: {}",
                error.without_url()
            ))
        })?;
        let elapsed_ms = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);

        let parsed: GenerateContentResponse = serde_json::from_slice(&body).map_err(|error| {
            SummarizationClientError::InvalidResponse(format!(
                "failed to decode Gemini response: {error}"
            ))
        })?;
        let summary = parsed.first_text().ok_or_else(|| {
            SummarizationClientError::InvalidResponse("response contained no candidate text".into())
        })?;

        tracing::debug!(model = %self.model, elapsed_ms, chars = summary.len(), "Summary generated");
        Ok(Summary {
            summary: summary.trim().to_string(),
            model: self.model.clone(),
            elapsed_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};

    fn client(base_url: String) -> GeminiClient {
        GeminiClient {
            http: Client::builder()
                .user_agent("dms-pipeline-test")
                .build()
                .expect("client"),
            base_url,
            model: "gemini-test".into(),
            api_key: "secret key".into(),
        }
    }

    #[tokio::test]
    async fn gemini_client_handles_successful_response() {
        let server = MockServer::start_async().await;
        let client = client(server.base_url());

        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1beta/models/gemini-test:generateContent")
                    .query_param_exists("key")
                    .body_contains("following text:\\n\\nhello world");
                then.status(200).json_body(json!({
                    "candidates": [{
                        "content": { "parts": [{ "text": "  - greets the world\n" }] }
                    }]
                }));
            })
            .await;

        let summary = client.summarize("hello world").await.expect("summary");

        mock.assert_async().await;
        assert_eq!(summary.summary, "- greets the world");
        assert_eq!(summary.model, "gemini-test");
        assert!(summary.elapsed_ms >= 0);
    }

    #[tokio::test]
    async fn gemini_client_handles_error_status() {
        let server = MockServer::start_async().await;
        let client = client(server.base_url());

        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(503).body("overloaded");
            })
            .await;

        let error = client.summarize("text").await.expect_err("error response");
        assert!(
            matches!(error, SummarizationClientError::GenerationFailed(ref message) if message.contains("503"))
        );
    }

    #[tokio::test]
    async fn gemini_client_rejects_empty_candidates() {
        let server = MockServer::start_async().await;
        let client = client(server.base_url());

        server
            .mock_async(|when, then| {
                when.method(POST);
                then.status(200).json_body(json!({ "candidates": [] }));
            })
            .await;

        let error = client.summarize("text").await.expect_err("no candidates");
        assert!(matches!(error, SummarizationClientError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn gemini_client_reports_unreachable_provider() {
        let client = client("http://127.0.0.1:1".into());
        let error = client.summarize("text").await.expect_err("unreachable");
        assert!(matches!(error, SummarizationClientError::ProviderUnavailable(_)));
    }

    #[test]
    fn missing_api_key_is_reported() {
        let settings = GenAiSettings {
            api_key: None,
            model: "gemini-test".into(),
            base_url: "https://example.invalid".into(),
        };
        assert!(matches!(
            GeminiClient::new(&settings),
            Err(SummarizationClientError::ProviderUnavailable(_))
        ));
    }
}
