//! S3-compatible client implementation.

use std::path::Path;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};

/// Default size at which uploads switch to multipart.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;
/// Multipart part size.
pub const MULTIPART_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...)
    pub endpoint_url: Option<String>,
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket name
    pub bucket_name: String,
    /// Region
    pub region: String,
    /// Base URL for public object links
    pub public_base_url: Option<String>,
    /// Files at or above this size use multipart upload
    pub multipart_threshold: u64,
}

impl S3Config {
    /// Create config from environment variables.
    ///
    /// Returns `Ok(None)` when no credentials are configured.
    pub fn from_env() -> StorageResult<Option<Self>> {
        let access_key_id = non_empty_env("STORAGE_ACCESS_KEY_ID");
        let secret_access_key = non_empty_env("STORAGE_SECRET_ACCESS_KEY");
        let (access_key_id, secret_access_key) = match (access_key_id, secret_access_key) {
            (Some(id), Some(secret)) => (id, secret),
            _ => return Ok(None),
        };

        Ok(Some(Self {
            endpoint_url: non_empty_env("STORAGE_ENDPOINT_URL"),
            access_key_id,
            secret_access_key,
            bucket_name: non_empty_env("STORAGE_BUCKET")
                .ok_or_else(|| StorageError::config_error("STORAGE_BUCKET not set"))?,
            region: std::env::var("STORAGE_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            public_base_url: non_empty_env("STORAGE_PUBLIC_BASE_URL"),
            multipart_threshold: std::env::var("STORAGE_MULTIPART_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MULTIPART_THRESHOLD),
        }))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// S3-compatible storage client.
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
    multipart_threshold: u64,
}

impl S3Client {
    /// Create a new client from configuration.
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "vpipe",
        );

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket_name.clone(),
            multipart_threshold: config.multipart_threshold.max(MULTIPART_PART_SIZE),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Upload a file, choosing single or multipart by size. Returns the byte count.
    pub async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<u64> {
        let size = tokio::fs::metadata(path).await?.len();
        if size >= self.multipart_threshold {
            self.upload_multipart(path, key, content_type, size).await?;
        } else {
            self.put_object(path, key, content_type).await?;
        }
        Ok(size)
    }

    async fn put_object(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<()> {
        debug!("Uploading {} to {}", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        Ok(())
    }

    async fn upload_multipart(&self, path: &Path, key: &str, content_type: &str, size: u64) -> StorageResult<()> {
        info!(
            "Multipart upload of {} ({} bytes, {} parts) to {}",
            path.display(),
            size,
            part_count(size, MULTIPART_PART_SIZE),
            key
        );

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::upload_failed("multipart upload returned no upload id"))?
            .to_string();

        match self.upload_parts(path, key, &upload_id).await {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
                let result = self
                    .client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await;
                if let Err(e) = result {
                    self.abort_multipart(key, &upload_id).await;
                    return Err(StorageError::upload_failed(e.to_string()));
                }
                Ok(())
            }
            Err(e) => {
                self.abort_multipart(key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, path: &Path, key: &str, upload_id: &str) -> StorageResult<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;

        loop {
            let mut buf = Vec::with_capacity(MULTIPART_PART_SIZE as usize);
            (&mut file).take(MULTIPART_PART_SIZE).read_to_end(&mut buf).await?;
            if buf.is_empty() {
                break;
            }

            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| StorageError::upload_failed(format!("part {}: {}", part_number, e)))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }

        Ok(parts)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!("Failed to abort multipart upload {} for {}: {}", upload_id, key, e);
        }
    }

    /// Stream an object into a local file.
    pub async fn download_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        debug!("Downloading {} to {}", key, path.display());

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = format!("{:?}", e);
                if message.contains("NoSuchKey") || message.contains("NotFound") {
                    StorageError::not_found(key)
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut body = response.body;
        let mut written = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!("Downloaded {} ({} bytes) to {}", key, written, path.display());
        Ok(written)
    }

    /// Delete an object.
    pub async fn delete_object(&self, key: &str) -> StorageResult<()> {
        debug!("Deleting {}", key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::delete_failed(e.to_string()))?;

        Ok(())
    }

    /// Check if an object exists.
    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = format!("{:?}", e);
                if message.contains("NotFound") || message.contains("NoSuchKey") {
                    Ok(false)
                } else {
                    Err(StorageError::AwsSdk(e.to_string()))
                }
            }
        }
    }
}

/// Number of parts needed for `size` bytes.
pub fn part_count(size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    size.div_ceil(part_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_count() {
        assert_eq!(part_count(16 * 1024 * 1024, MULTIPART_PART_SIZE), 2);
        assert_eq!(part_count(16 * 1024 * 1024 + 1, MULTIPART_PART_SIZE), 3);
        assert_eq!(part_count(0, MULTIPART_PART_SIZE), 0);
    }

    #[test]
    fn test_threshold_default() {
        assert_eq!(DEFAULT_MULTIPART_THRESHOLD, 16 * 1024 * 1024);
        assert!(DEFAULT_MULTIPART_THRESHOLD >= MULTIPART_PART_SIZE);
    }
}
