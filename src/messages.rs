//! Versioned JSON contracts exchanged between pipeline stages.
//!
//! Field names on the wire are PascalCase and form the contract shared with the metadata
//! API. Unknown fields are ignored on decode so producers can add fields without breaking
//! older consumers; missing required fields fail decoding. Each contract carries a versioned
//! `KIND` that publishers place in the AMQP `type` property.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use time::OffsetDateTime;

/// Errors raised while turning queue bytes into a typed contract.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload was not valid JSON for the contract (including missing required fields).
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        /// Contract the payload was decoded as.
        kind: &'static str,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
    /// Payload parsed but violates a business rule of the contract.
    #[error("invalid {kind} payload: {reason}")]
    Invalid {
        /// Contract the payload was decoded as.
        kind: &'static str,
        /// Rule that failed.
        reason: String,
    },
}

/// A message shape carried on one of the pipeline queues.
pub trait Contract: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Versioned contract name, e.g. `ocr-request.v1`.
    const KIND: &'static str;

    /// Identifier of the owning document, stable across all stages.
    fn document_id(&self) -> i64;

    /// Check business rules that serde cannot express.
    fn validate(&self) -> Result<(), String> {
        if self.document_id() <= 0 {
            return Err(format!("DocumentId must be positive, got {}", self.document_id()));
        }
        Ok(())
    }
}

/// Serialize a contract into JSON bytes.
///
/// Fails for timestamps RFC 3339 cannot represent, such as years outside `0..=9999`.
pub fn encode<M: Contract>(message: &M) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Parse and validate a contract from JSON bytes.
pub fn decode<M: Contract>(bytes: &[u8]) -> Result<M, DecodeError> {
    let message: M = serde_json::from_slice(bytes).map_err(|source| DecodeError::Malformed {
        kind: M::KIND,
        source,
    })?;
    message.validate().map_err(|reason| DecodeError::Invalid {
        kind: M::KIND,
        reason,
    })?;
    Ok(message)
}

/// Request to extract text from an uploaded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OcrRequest {
    /// Document identifier assigned by the metadata store.
    pub document_id: i64,
    /// Human readable title.
    pub title: String,
    /// Object key of the uploaded file within the document bucket.
    pub file_path: String,
    /// Upload time.
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at_utc: OffsetDateTime,
    /// Time the message was produced.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub produced_at_utc: Option<OffsetDateTime>,
}

impl Contract for OcrRequest {
    const KIND: &'static str = "ocr-request.v1";

    fn document_id(&self) -> i64 {
        self.document_id
    }

    fn validate(&self) -> Result<(), String> {
        if self.document_id <= 0 {
            return Err(format!("DocumentId must be positive, got {}", self.document_id));
        }
        if self.file_path.trim().is_empty() {
            return Err("FilePath must not be blank".into());
        }
        Ok(())
    }
}

/// Extracted text handed to the summarization stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GenAiRequest {
    /// Document identifier.
    pub document_id: i64,
    /// Text recognized from the document; may be empty.
    pub text: String,
    /// Document title.
    pub title: String,
    /// Time the message was produced.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub produced_at_utc: Option<OffsetDateTime>,
}

impl Contract for GenAiRequest {
    const KIND: &'static str = "genai-request.v1";

    fn document_id(&self) -> i64 {
        self.document_id
    }
}

/// Summary produced for a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GenAiResult {
    /// Document identifier.
    pub document_id: i64,
    /// Generated summary text.
    pub summary: String,
    /// Model that produced the summary.
    pub model: String,
    /// Wall-clock time spent in the provider call.
    pub processing_time_ms: i32,
    /// Time the message was produced.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub produced_at_utc: Option<OffsetDateTime>,
}

impl Contract for GenAiResult {
    const KIND: &'static str = "genai-result.v1";

    fn document_id(&self) -> i64 {
        self.document_id
    }
}

/// Document body to upsert into the search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchIndexMessage {
    /// Document identifier, used as the search document identity.
    pub document_id: i64,
    /// Document title.
    pub title: String,
    /// Extracted text.
    pub text: String,
    /// Time the message was produced.
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub produced_at_utc: Option<OffsetDateTime>,
}

impl Contract for SearchIndexMessage {
    const KIND: &'static str = "search-index.v1";

    fn document_id(&self) -> i64 {
        self.document_id
    }
}
