//! Write-only search sink used by the index stage.

pub mod elasticsearch;
pub mod memory;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

pub use elasticsearch::ElasticsearchService;
pub use memory::MemorySearchIndex;

/// Errors that can occur when interacting with the search engine.
#[derive(Debug, Error)]
pub enum SearchIndexError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid search engine URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The search engine responded with an unexpected status code.
    #[error("Unexpected search engine response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the search engine.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// Document sink keyed by document id. Writes replace any previous version.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index when it does not exist yet.
    async fn ensure_index(&self) -> Result<(), SearchIndexError>;

    /// Insert or overwrite the search document for `document_id`.
    async fn upsert_document(
        &self,
        document_id: i64,
        title: &str,
        text: &str,
    ) -> Result<(), SearchIndexError>;
}
