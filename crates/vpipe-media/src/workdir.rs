//! Per-job output directory guard.

use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::MediaResult;

/// Output directory removed on drop unless [`OutputDir::keep`] is called.
///
/// Every early return or `?` in the encode path drops the guard, so partial
/// renditions never outlive a failed job.
#[derive(Debug)]
pub struct OutputDir {
    path: PathBuf,
    armed: bool,
}

impl OutputDir {
    /// Create the directory (and parents). An existing directory is emptied first.
    pub async fn create(path: impl AsRef<Path>) -> MediaResult<Self> {
        let path = path.as_ref().to_path_buf();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&path).await?;
        }
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path, armed: true })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarm the guard and hand the directory to the caller.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for OutputDir {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove output directory {}: {}", self.path.display(), e);
            }
        }
    }
}
