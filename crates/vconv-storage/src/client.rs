//! S3 backend implementation.
//!
//! Works against AWS S3 and S3-compatible stores (R2, MinIO) when a
//! custom endpoint is configured. Conditional creates rely on
//! `If-None-Match: *`, which the store answers with 412 (or 409 while a
//! concurrent conditional write is in flight) when the key exists.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::backend::{Backend, CreateOutcome};
use crate::error::{StorageError, StorageResult};

/// Configuration for the S3 backend.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Bucket name
    pub bucket_name: String,
    /// Custom endpoint for S3-compatible stores
    pub endpoint_url: Option<String>,
    /// Region override (defaults to the AWS provider chain)
    pub region: Option<String>,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            bucket_name: std::env::var("BUCKET_NAME").unwrap_or_else(|_| "main_il".to_string()),
            endpoint_url: std::env::var("S3_ENDPOINT_URL").ok().filter(|s| !s.is_empty()),
            region: std::env::var("S3_REGION").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// S3 storage backend.
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

/// Render an SDK error with its full source chain.
fn sdk_message<E, R>(err: &SdkError<E, R>) -> String
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    DisplayErrorContext(err).to_string()
}

impl S3Backend {
    /// Create a new backend from configuration.
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket_name.is_empty() {
            return Err(StorageError::config_error("bucket name is empty"));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = config.region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        let mut builder = Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        let client = Client::from_conf(builder.build());

        info!(
            bucket = %config.bucket_name,
            endpoint = config.endpoint_url.as_deref().unwrap_or("aws"),
            "S3 backend ready"
        );

        Ok(Self {
            client,
            bucket: config.bucket_name,
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> StorageResult<Self> {
        Self::new(S3Config::from_env()).await
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Check connectivity by performing a head bucket operation.
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| {
                StorageError::AwsSdk(format!("S3 connectivity check failed: {}", sdk_message(&e)))
            })?;
        Ok(())
    }

    async fn get_object(
        &self,
        key: &str,
    ) -> StorageResult<aws_sdk_s3::operation::get_object::GetObjectOutput> {
        self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()) == Some(true) {
                    StorageError::not_found(key)
                } else {
                    StorageError::download_failed(sdk_message(&e))
                }
            })
    }
}

#[async_trait]
impl Backend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        debug!("Listing objects with prefix: {}", prefix);

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| StorageError::ListFailed(sdk_message(&e)))?;

            keys.extend(response.contents().iter().filter_map(|obj| obj.key().map(str::to_string)));

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        debug!("Downloading {}", key);

        let response = self.get_object(key).await?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
            .into_bytes()
            .to_vec();

        Ok(bytes)
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        debug!("Uploading {} bytes to {}", data.len(), key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(sdk_message(&e)))?;

        Ok(())
    }

    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> StorageResult<CreateOutcome> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(ByteStream::from(data))
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(e) => match e.raw_response().map(|r| r.status().as_u16()) {
                Some(412) | Some(409) => {
                    debug!(key, "Conditional create lost: key exists");
                    Ok(CreateOutcome::AlreadyExists)
                }
                _ => Err(StorageError::upload_failed(sdk_message(&e))),
            },
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        debug!("Deleting {}", key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::delete_failed(sdk_message(&e)))?;

        Ok(())
    }

    async fn download_file(&self, key: &str, path: &Path) -> StorageResult<()> {
        debug!("Downloading {} to {}", key, path.display());

        let response = self.get_object(key).await?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StorageError::download_failed(format!("Failed to create directory: {}", e))
            })?;
        }

        let mut reader = response.body.into_async_read();
        let mut file = tokio::fs::File::create(path).await.map_err(|e| {
            StorageError::download_failed(format!("Failed to create file: {}", e))
        })?;
        let written = tokio::io::copy(&mut reader, &mut file).await.map_err(|e| {
            StorageError::download_failed(format!("Failed to write file: {}", e))
        })?;
        file.flush().await?;

        info!("Downloaded {} ({} bytes) to {}", key, written, path.display());
        Ok(())
    }

    async fn upload_file(&self, path: &Path, key: &str) -> StorageResult<()> {
        debug!("Uploading {} to {}", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("video/mp4")
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(sdk_message(&e)))?;

        info!("Uploaded {} to {}", path.display(), key);
        Ok(())
    }
}
