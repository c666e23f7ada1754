//! REST implementation of [`DocumentStore`] against the DMS API.

use super::{DocumentStore, DocumentStoreError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Updates document summaries through `PUT /api/documents/{id}/summary`.
pub struct HttpDocumentStore {
    pub(crate) client: Client,
    pub(crate) base_url: String,
}

impl HttpDocumentStore {
    /// Construct a client for the API at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, DocumentStoreError> {
        let parsed = reqwest::Url::parse(base_url)
            .map_err(|error| DocumentStoreError::InvalidUrl(format!("{base_url}: {error}")))?;
        let client = Client::builder()
            .user_agent("dms-pipeline/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn summary_endpoint(&self, document_id: i64) -> String {
        format!("{}/api/documents/{document_id}/summary", self.base_url)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn update_summary(
        &self,
        document_id: i64,
        summary: &str,
    ) -> Result<(), DocumentStoreError> {
        let response = self
            .client
            .put(self.summary_endpoint(document_id))
            .json(&json!({ "summary": summary }))
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                tracing::debug!(document_id, chars = summary.len(), "Summary stored");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(DocumentStoreError::NotFound(document_id)),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = DocumentStoreError::UnexpectedStatus { status, body };
                tracing::error!(document_id, error = %error, "Summary update failed");
                Err(error)
            }
        }
    }
}
