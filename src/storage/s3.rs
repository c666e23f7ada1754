//! MinIO / S3-compatible backend built on the AWS SDK.

use super::{ObjectStore, StorageError, StorageResult};
use crate::config::StorageSettings;
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;

const CREDENTIALS_SOURCE: &str = "dms-config";

/// Object store talking to an S3-compatible endpoint with path-style addressing.
pub struct S3ObjectStore {
    bucket: String,
    client: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Build a client from storage settings. Missing credentials fall back to the SDK's default
    /// provider chain.
    pub async fn new(settings: &StorageSettings) -> StorageResult<Self> {
        if settings.bucket.trim().is_empty() {
            return Err(StorageError::Config("bucket name is empty".into()));
        }
        tracing::info!(endpoint = %settings.endpoint, bucket = %settings.bucket, "Initializing object storage");

        let mut sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));
        if let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key) {
            sdk_config = sdk_config.credentials_provider(aws_credential_types::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                CREDENTIALS_SOURCE,
            ));
        }
        let sdk_config = sdk_config.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .endpoint_url(&settings.endpoint)
            .force_path_style(true)
            .build();

        Ok(Self {
            bucket: settings.bucket.clone(),
            client: aws_sdk_s3::Client::from_conf(s3_config),
        })
    }
}

fn service_error(error: impl std::error::Error) -> StorageError {
    StorageError::S3(DisplayErrorContext(error).to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn ensure_bucket(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(error) if error.as_service_error().is_some_and(|e| e.is_not_found()) => {}
            Err(error) => return Err(service_error(error)),
        }

        tracing::info!(bucket = %self.bucket, "Creating bucket");
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|e| e.is_bucket_already_owned_by_you()) =>
            {
                Ok(())
            }
            Err(error) => Err(service_error(error)),
        }
    }

    async fn put(&self, key: &str, content: Vec<u8>, content_type: &str) -> StorageResult<()> {
        let size = content.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|error| {
                tracing::error!(key, error = %DisplayErrorContext(&error), "Upload failed");
                service_error(error)
            })?;
        tracing::info!(key, bucket = %self.bucket, size, "Object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        tracing::debug!(key, bucket = %self.bucket, "Fetching object");
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| {
                if error.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    StorageError::NotFound(key.to_string())
                } else {
                    service_error(error)
                }
            })?;

        let content = response
            .body
            .collect()
            .await
            .map_err(|error| StorageError::S3(format!("reading object body failed: {error}")))?
            .to_vec();
        Ok(content)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(error) if error.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(false),
            Err(error) => Err(service_error(error)),
        }
    }
}
