//! Target filesystem
//!
//! Final destination for assembled uploads. Paths supplied by clients are
//! resolved relative to the storage root and may not leave it.

use std::io;
use std::path::{Component, Path, PathBuf};

use futures::stream::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::upload::UploadError;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Storage root for completed files
#[derive(Debug, Clone)]
pub struct TargetFs {
    root: PathBuf,
}

/// Outcome of writing a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

impl TargetFs {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve a client-supplied relative path under the root
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, UploadError> {
        let relative = relative.trim_start_matches('/');
        let mut resolved = self.root.clone();
        let mut depth = 0;

        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(UploadError::Validation(format!(
                        "Target path escapes storage root: {}",
                        relative
                    )));
                }
            }
        }

        if depth == 0 {
            return Err(UploadError::Validation("Target path is empty".to_string()));
        }

        Ok(resolved)
    }

    /// Concatenate `parts` into the file at `relative`.
    ///
    /// Bytes land in a hidden sibling first and are renamed into place only
    /// after everything has been written and synced, so the target either
    /// holds the complete file or is left as it was.
    pub async fn write_concatenated<S, R>(
        &self,
        relative: &str,
        tag: &str,
        mut parts: S,
    ) -> Result<WrittenFile, UploadError>
    where
        S: Stream<Item = io::Result<R>> + Unpin,
        R: AsyncRead + Unpin,
    {
        let path = self.resolve(relative)?;
        let parent = path
            .parent()
            .ok_or_else(|| UploadError::Validation(format!("Invalid target path: {}", relative)))?;
        fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = parent.join(format!(".{}.{}.partial", file_name, tag));

        let mut out = File::create(&partial).await?;
        let mut hasher = Sha256::new();
        let mut bytes: u64 = 0;

        let copied: io::Result<()> = async {
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            while let Some(part) = parts.next().await {
                let mut reader = part?;
                loop {
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n]).await?;
                    hasher.update(&buf[..n]);
                    bytes += n as u64;
                }
            }
            out.flush().await?;
            out.sync_all().await
        }
        .await;
        drop(out);

        if let Err(e) = copied {
            remove_partial(&partial).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&partial, &path).await {
            remove_partial(&partial).await;
            return Err(e.into());
        }

        Ok(WrittenFile {
            path,
            bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file");
        }
    }
}
