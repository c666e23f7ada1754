//! Object storage holding uploaded PDFs.
//!
//! Stages depend on the [`ObjectStore`] trait; [`s3::S3ObjectStore`] talks to MinIO or any
//! S3-compatible service and [`memory::MemoryObjectStore`] keeps objects in process.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Errors raised by object storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),
    /// Local file I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The storage service returned an error or was unreachable.
    #[error("S3 error: {0}")]
    S3(String),
    /// The backend could not be configured.
    #[error("storage configuration error: {0}")]
    Config(String),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Bucket-scoped object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket every key is resolved against.
    fn bucket(&self) -> &str;

    /// Create the bucket when it does not exist yet.
    async fn ensure_bucket(&self) -> StorageResult<()>;

    /// Store `content` under `key`, replacing any previous object.
    async fn put(&self, key: &str, content: Vec<u8>, content_type: &str) -> StorageResult<()>;

    /// Fetch the full content of `key`.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Whether `key` exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Download `key` into a local file, returning the number of bytes written.
    async fn download_to(&self, key: &str, destination: &Path) -> StorageResult<u64> {
        let content = self.get(key).await?;
        tokio::fs::write(destination, &content).await?;
        Ok(content.len() as u64)
    }
}
