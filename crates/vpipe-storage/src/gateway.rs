//! Storage gateway seam used by the worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::{S3Client, S3Config};
use crate::error::{StorageError, StorageResult};

/// An object written by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedObject {
    /// Public URL of the object
    pub url: String,
    /// Bucket name, or the local root for the disabled gateway
    pub bucket: String,
    pub key: String,
    /// Size in bytes
    pub size: u64,
}

/// Upload/download contract for transcoding outputs and sources.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Whether a remote object store is configured.
    fn is_enabled(&self) -> bool;

    /// Public URL for a key.
    fn public_url(&self, key: &str) -> String;

    /// Upload one local file under `key`.
    async fn upload(&self, local: &Path, key: &str) -> StorageResult<UploadedObject>;

    /// Download `key` into `local`.
    async fn download(&self, key: &str, local: &Path) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Upload every file under `dir`, keyed `<prefix>/<relative path>`.
    async fn upload_directory(&self, dir: &Path, prefix: &str) -> StorageResult<Vec<UploadedObject>> {
        let files = list_files(dir).await?;
        let mut uploaded = Vec::with_capacity(files.len());
        for file in files {
            let relative = file
                .strip_prefix(dir)
                .map_err(|_| StorageError::InvalidKey(file.display().to_string()))?;
            let key = join_key(prefix, &relative.to_string_lossy());
            uploaded.push(self.upload(&file, &key).await?);
        }
        Ok(uploaded)
    }
}

/// Content type for a file, derived from its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "m3u8" => "application/vnd.apple.mpegurl",
        "ts" => "video/mp2t",
        "m4s" => "video/iso.segment",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Reject keys that are empty, absolute, or escape their prefix.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Join a prefix and a relative path with a single `/`.
pub fn join_key(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let relative = relative.replace('\\', "/");
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

fn url_for(base: &str, key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect();
    format!("{}/{}", base.trim_end_matches('/'), encoded.join("/"))
}

/// Files under `dir`, recursively, in sorted order.
async fn list_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Gateway backed by an S3-compatible bucket.
#[derive(Clone)]
pub struct S3Gateway {
    client: S3Client,
    public_base_url: String,
}

impl S3Gateway {
    pub async fn new(config: &S3Config) -> StorageResult<Self> {
        let client = S3Client::new(config).await?;
        let public_base_url = match (&config.public_base_url, &config.endpoint_url) {
            (Some(base), _) => base.clone(),
            (None, Some(endpoint)) => format!("{}/{}", endpoint.trim_end_matches('/'), config.bucket_name),
            (None, None) => format!(
                "https://{}.s3.{}.amazonaws.com",
                config.bucket_name, config.region
            ),
        };
        Ok(Self {
            client,
            public_base_url,
        })
    }

    pub fn client(&self) -> &S3Client {
        &self.client
    }
}

#[async_trait]
impl StorageGateway for S3Gateway {
    fn is_enabled(&self) -> bool {
        true
    }

    fn public_url(&self, key: &str) -> String {
        url_for(&self.public_base_url, key)
    }

    async fn upload(&self, local: &Path, key: &str) -> StorageResult<UploadedObject> {
        validate_key(key)?;
        let size = self.client.upload_file(local, key, content_type_for(local)).await?;
        debug!("Uploaded {} to s3://{}/{}", local.display(), self.client.bucket(), key);
        Ok(UploadedObject {
            url: self.public_url(key),
            bucket: self.client.bucket().to_string(),
            key: key.to_string(),
            size,
        })
    }

    async fn download(&self, key: &str, local: &Path) -> StorageResult<()> {
        validate_key(key)?;
        self.client.download_file(key, local).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        self.client.exists(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.client.delete_object(key).await
    }
}

/// Gateway used when no object store is configured: copies into a local directory.
#[derive(Debug, Clone)]
pub struct LocalGateway {
    root: PathBuf,
    base_url: Option<String>,
}

impl LocalGateway {
    /// Create the gateway, creating `root` if needed.
    pub fn new(root: impl AsRef<Path>, base_url: Option<String>) -> StorageResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.canonicalize()?,
            base_url,
        })
    }

    /// Create from `STORAGE_LOCAL_DIR` and `STORAGE_LOCAL_BASE_URL`.
    pub fn from_env() -> StorageResult<Self> {
        let root = std::env::var("STORAGE_LOCAL_DIR").unwrap_or_else(|_| "./storage".to_string());
        let base_url = std::env::var("STORAGE_LOCAL_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self::new(root, base_url)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl StorageGateway for LocalGateway {
    fn is_enabled(&self) -> bool {
        false
    }

    fn public_url(&self, key: &str) -> String {
        match &self.base_url {
            Some(base) => url_for(base, key),
            None => format!("file://{}", self.root.join(key).display()),
        }
    }

    async fn upload(&self, local: &Path, key: &str) -> StorageResult<UploadedObject> {
        let target = self.path_for(key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size = tokio::fs::copy(local, &target).await?;
        Ok(UploadedObject {
            url: self.public_url(key),
            bucket: self.root.display().to_string(),
            key: key.to_string(),
            size,
        })
    }

    async fn download(&self, key: &str, local: &Path) -> StorageResult<()> {
        let source = self.path_for(key)?;
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StorageError::not_found(key));
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, local).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Pick the S3 gateway when credentials are configured, the local one otherwise.
pub async fn gateway_from_env() -> StorageResult<Arc<dyn StorageGateway>> {
    match S3Config::from_env()? {
        Some(config) => {
            info!(bucket = %config.bucket_name, "Storage gateway: S3");
            Ok(Arc::new(S3Gateway::new(&config).await?))
        }
        None => {
            let local = LocalGateway::from_env()?;
            info!(root = %local.root().display(), "Storage gateway disabled, writing to local directory");
            Ok(Arc::new(local))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("master.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for(Path::new("720p/segment_000.ts")), "video/mp2t");
        assert_eq!(content_type_for(Path::new("thumbnail.JPG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("blob")), "application/octet-stream");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("videos/v1/master.m3u8").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("videos/../etc").is_err());
        assert!(validate_key("videos//x").is_err());
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("videos/v1/", "720p/index.m3u8"), "videos/v1/720p/index.m3u8");
        assert_eq!(join_key("", "a.ts"), "a.ts");
    }

    #[test]
    fn test_url_encodes_segments() {
        assert_eq!(
            url_for("https://cdn.example.com/", "videos/my video/master.m3u8"),
            "https://cdn.example.com/videos/my%20video/master.m3u8"
        );
    }

    #[tokio::test]
    async fn test_local_gateway_round_trip() {
        let store = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let gateway = LocalGateway::new(store.path(), None).unwrap();
        assert!(!gateway.is_enabled());

        let src = work.path().join("thumbnail.jpg");
        std::fs::write(&src, b"jpeg").unwrap();

        let obj = gateway.upload(&src, "videos/v1/thumbnail.jpg").await.unwrap();
        assert_eq!(obj.size, 4);
        assert!(obj.url.starts_with("file://"));
        assert!(obj.url.ends_with("videos/v1/thumbnail.jpg"));
        assert!(gateway.exists("videos/v1/thumbnail.jpg").await.unwrap());

        let back = work.path().join("copy.jpg");
        gateway.download("videos/v1/thumbnail.jpg", &back).await.unwrap();
        assert_eq!(std::fs::read(&back).unwrap(), b"jpeg");

        gateway.delete("videos/v1/thumbnail.jpg").await.unwrap();
        assert!(!gateway.exists("videos/v1/thumbnail.jpg").await.unwrap());
        gateway.delete("videos/v1/thumbnail.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_gateway_base_url() {
        let store = TempDir::new().unwrap();
        let gateway =
            LocalGateway::new(store.path(), Some("http://localhost:8080/media".to_string())).unwrap();
        assert_eq!(
            gateway.public_url("videos/v1/master.m3u8"),
            "http://localhost:8080/media/videos/v1/master.m3u8"
        );
    }

    #[tokio::test]
    async fn test_local_download_missing_key() {
        let store = TempDir::new().unwrap();
        let gateway = LocalGateway::new(store.path(), None).unwrap();
        let err = gateway
            .download("in/missing.mp4", &store.path().join("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upload_directory_keys() {
        let store = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        std::fs::create_dir_all(work.path().join("720p")).unwrap();
        std::fs::write(work.path().join("720p/index.m3u8"), b"#EXTM3U").unwrap();
        std::fs::write(work.path().join("720p/segment_000.ts"), b"ts").unwrap();

        let gateway = LocalGateway::new(store.path(), None).unwrap();
        let uploaded = gateway
            .upload_directory(&work.path().join("720p"), "videos/v1/720p")
            .await
            .unwrap();

        let keys: Vec<_> = uploaded.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["videos/v1/720p/index.m3u8", "videos/v1/720p/segment_000.ts"]);
        assert!(store.path().join("videos/v1/720p/segment_000.ts").exists());
    }
}
