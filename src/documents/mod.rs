//! Client for the metadata API that owns document records.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

pub use http::HttpDocumentStore;
pub use memory::MemoryDocumentStore;

/// Errors raised while updating document metadata.
#[derive(Debug, Error)]
pub enum DocumentStoreError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid metadata API URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The document no longer exists.
    #[error("document {0} not found")]
    NotFound(i64),
    /// The API responded with an unexpected status code.
    #[error("Unexpected metadata API response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the API.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
}

/// Write access to document metadata.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Overwrite the stored summary of `document_id`.
    async fn update_summary(&self, document_id: i64, summary: &str)
    -> Result<(), DocumentStoreError>;
}
