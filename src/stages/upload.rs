//! Head of the pipeline: store an uploaded PDF and request OCR for it.

use crate::broker::{BrokerError, Publisher, Route, publish_message};
use crate::messages::{Contract, OcrRequest};
use crate::storage::{ObjectStore, StorageError};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PDF_CONTENT_TYPE: &str = "application/pdf";
const MAX_KEY_STEM: usize = 64;
const HASH_PREFIX_LEN: usize = 16;

/// Reasons an upload is rejected or could not be completed.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Content does not start with a PDF header.
    #[error("uploaded content is not a PDF")]
    NotPdf,
    /// The resulting OCR request would violate a contract rule.
    #[error("invalid upload: {0}")]
    Invalid(String),
    /// Storing the object failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Publishing the OCR request failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// A document handed in by a client.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Identifier assigned by the metadata store.
    pub document_id: i64,
    /// Human-readable title.
    pub title: String,
    /// Raw file content.
    pub content: Vec<u8>,
}

/// Stores uploads in object storage and publishes an `OcrRequest` for each.
pub struct UploadTrigger {
    store: Arc<dyn ObjectStore>,
    route: Route,
}

impl UploadTrigger {
    /// Publish OCR requests to `exchange` with `routing_key`.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            route: Route::exchange(exchange, routing_key),
        }
    }

    /// Store the document and request OCR. Returns the published request.
    ///
    /// The object key is derived from the content, so repeating a failed upload overwrites the
    /// same object instead of leaving orphans behind.
    pub async fn submit(
        &self,
        publisher: &dyn Publisher,
        request: UploadRequest,
    ) -> Result<OcrRequest, UploadError> {
        if !request.content.starts_with(PDF_MAGIC) {
            return Err(UploadError::NotPdf);
        }

        let now = OffsetDateTime::now_utc();
        let message = OcrRequest {
            document_id: request.document_id,
            file_path: object_key(&request.title, &request.content),
            title: request.title,
            uploaded_at_utc: now,
            produced_at_utc: Some(now),
        };
        message.validate().map_err(UploadError::Invalid)?;

        let size = request.content.len();
        self.store
            .put(&message.file_path, request.content, PDF_CONTENT_TYPE)
            .await?;
        publish_message(publisher, &self.route, &message).await?;

        tracing::info!(
            document_id = message.document_id,
            key = %message.file_path,
            bucket = self.store.bucket(),
            size,
            "Upload queued for OCR"
        );
        Ok(message)
    }
}

/// Content-addressed object key: `{sanitized title}_{sha256 prefix}.pdf`.
pub fn object_key(title: &str, content: &[u8]) -> String {
    let mut stem: String = title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .take(MAX_KEY_STEM)
        .collect();
    if stem.is_empty() {
        stem.push_str("document");
    }
    let digest = hex::encode(Sha256::digest(content));
    format!("{stem}_{}.pdf", &digest[..HASH_PREFIX_LEN])
}
