//! Storage quota gate

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::upload::UploadError;

/// Pre-check invoked before committing to store more bytes
#[async_trait::async_trait]
pub trait QuotaGate: Send + Sync {
    /// Fail with `QuotaExceeded` if `additional_bytes` would not fit
    async fn check(&self, additional_bytes: u64) -> Result<(), UploadError>;
}

/// Gate that admits everything
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait::async_trait]
impl QuotaGate for Unlimited {
    async fn check(&self, _additional_bytes: u64) -> Result<(), UploadError> {
        Ok(())
    }
}

/// Byte limit over everything stored under a directory
#[derive(Debug, Clone)]
pub struct DirectoryQuota {
    root: PathBuf,
    limit_bytes: u64,
}

impl DirectoryQuota {
    pub fn new(root: PathBuf, limit_bytes: u64) -> Self {
        Self { root, limit_bytes }
    }

    /// Total size of all files under the root
    pub async fn usage(&self) -> Result<u64, UploadError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || dir_size(&root))
            .await
            .map_err(|e| UploadError::Internal(format!("Usage scan panicked: {}", e)))?
            .map_err(UploadError::from)
    }
}

#[async_trait::async_trait]
impl QuotaGate for DirectoryQuota {
    async fn check(&self, additional_bytes: u64) -> Result<(), UploadError> {
        let used = self.usage().await?;
        let projected = used.saturating_add(additional_bytes);

        if projected > self.limit_bytes {
            tracing::info!(
                used = used,
                requested = additional_bytes,
                limit = self.limit_bytes,
                "Quota check rejected upload"
            );
            return Err(UploadError::QuotaExceeded(format!(
                "allocated {} bytes, requested operation would result in {} bytes",
                self.limit_bytes, projected
            )));
        }

        Ok(())
    }
}

fn dir_size(root: &Path) -> io::Result<u64> {
    if !root.exists() {
        return Ok(0);
    }

    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::from)?.len();
        }
    }

    Ok(total)
}
