//! Chunk Store
//!
//! Temporary storage for uploaded chunks before assembly. Each session owns
//! one directory under the store's base path; each chunk is one file in it,
//! addressed by its index.
//!
//! Incoming bytes are first streamed into a staging file and only replace the
//! chunk file once the caller commits them, so a rejected write never clobbers
//! a chunk that was accepted earlier.

use std::io;
use std::path::{Path, PathBuf};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::types::UploadError;

// ============================================================================
// Chunk Store
// ============================================================================

/// Local filesystem chunk store
#[derive(Debug, Clone)]
pub struct ChunkStore {
    base_path: PathBuf,
}

/// Handle to one session's chunk directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDir {
    path: PathBuf,
}

impl ChunkDir {
    /// Rebuild a handle from a path recorded in the session registry
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn chunk_path(&self, index: u64) -> PathBuf {
        self.path.join(format!("{:08}.chunk", index))
    }

    fn staging_path(&self, index: u64) -> PathBuf {
        self.path.join(format!("{:08}.chunk.part", index))
    }
}

impl ChunkStore {
    /// Create a store rooted at `base_path`
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Create an empty directory scoped to `session_id`
    pub async fn allocate(&self, session_id: &str) -> Result<ChunkDir, UploadError> {
        let path = self.base_path.join(session_id);
        fs::create_dir_all(&path).await?;

        tracing::debug!(
            session_id = %session_id,
            path = %path.display(),
            "Allocated chunk directory"
        );

        Ok(ChunkDir { path })
    }

    /// Stream `body` into the staging slot for `index`.
    ///
    /// Reading stops as soon as more than `limit` bytes have arrived; the
    /// returned length then exceeds `limit` and the chunk can only be
    /// discarded. Nothing is visible at `index` until [`StagedChunk::commit`].
    pub async fn write_chunk<S, B>(
        &self,
        dir: &ChunkDir,
        index: u64,
        mut body: S,
        limit: u64,
    ) -> Result<StagedChunk, UploadError>
    where
        S: Stream<Item = io::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        let staging = dir.staging_path(index);
        let mut file = File::create(&staging).await?;
        let mut hasher = Sha256::new();
        let mut len: u64 = 0;

        let copied: io::Result<()> = async {
            while let Some(frame) = body.next().await {
                let frame = frame?;
                let bytes = frame.as_ref();

                file.write_all(bytes).await?;
                hasher.update(bytes);
                len += bytes.len() as u64;

                if len > limit {
                    break;
                }
            }
            file.flush().await
        }
        .await;
        drop(file);

        if let Err(e) = copied {
            remove_if_exists(&staging).await;
            return Err(e.into());
        }

        Ok(StagedChunk {
            staging,
            target: dir.chunk_path(index),
            len,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    /// Stored length of the chunk at `index`, if one has been committed
    pub async fn chunk_len(&self, dir: &ChunkDir, index: u64) -> Result<Option<u64>, UploadError> {
        match fs::metadata(dir.chunk_path(index)).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether a chunk has been committed at `index`
    pub async fn has_chunk(&self, dir: &ChunkDir, index: u64) -> Result<bool, UploadError> {
        Ok(self.chunk_len(dir, index).await?.is_some())
    }

    /// Count committed chunks below `total_chunks` and their combined size
    pub async fn inventory(&self, dir: &ChunkDir, total_chunks: u64) -> Result<Inventory, UploadError> {
        let mut entries = fs::read_dir(&dir.path).await?;
        let mut inventory = Inventory::default();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let index = name
                .to_str()
                .and_then(|n| n.strip_suffix(".chunk"))
                .and_then(|n| n.parse::<u64>().ok());

            match index {
                Some(index) if index < total_chunks => {
                    let meta = entry.metadata().await?;
                    if meta.is_file() {
                        inventory.chunks += 1;
                        inventory.bytes += meta.len();
                    }
                }
                _ => {}
            }
        }

        Ok(inventory)
    }

    /// Open chunks `0..total_chunks` in ascending order.
    ///
    /// Presence of every index is verified up front; the files themselves are
    /// opened lazily as the stream is polled.
    pub async fn open_in_order(
        &self,
        dir: &ChunkDir,
        total_chunks: u64,
    ) -> Result<BoxStream<'static, io::Result<File>>, UploadError> {
        let mut missing = Vec::new();
        for index in 0..total_chunks {
            if !self.has_chunk(dir, index).await? {
                missing.push(index);
            }
        }

        if !missing.is_empty() {
            return Err(UploadError::IncompleteSet(missing));
        }

        let dir = dir.clone();
        Ok(stream::iter(0..total_chunks)
            .then(move |index| {
                let path = dir.chunk_path(index);
                async move { File::open(path).await }
            })
            .boxed())
    }

    /// Remove a session's chunk directory and everything in it.
    ///
    /// Succeeds if the directory is already gone.
    pub async fn destroy(&self, dir: &ChunkDir) -> Result<(), UploadError> {
        match fs::remove_dir_all(&dir.path).await {
            Ok(()) => {
                tracing::debug!(path = %dir.path.display(), "Removed chunk directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List every session directory currently under the base path
    pub async fn session_dirs(&self) -> Result<Vec<(String, ChunkDir)>, UploadError> {
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                dirs.push((name.to_string(), ChunkDir { path: entry.path() }));
            }
        }

        Ok(dirs)
    }
}

/// What a chunk directory currently holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inventory {
    pub chunks: u64,
    pub bytes: u64,
}

// ============================================================================
// Staged Chunk
// ============================================================================

/// Bytes received for one chunk, not yet visible in the store
#[derive(Debug)]
pub struct StagedChunk {
    staging: PathBuf,
    target: PathBuf,
    len: u64,
    sha256: String,
}

impl StagedChunk {
    /// Number of bytes received
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hex SHA-256 of the received bytes
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// Replace whatever is stored at this index with the staged bytes
    pub async fn commit(self) -> Result<u64, UploadError> {
        if let Err(e) = fs::rename(&self.staging, &self.target).await {
            remove_if_exists(&self.staging).await;
            return Err(e.into());
        }
        Ok(self.len)
    }

    /// Drop the staged bytes, leaving the stored chunk untouched
    pub async fn discard(self) {
        remove_if_exists(&self.staging).await;
    }
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove staged chunk");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn body(parts: &[&'static [u8]]) -> impl Stream<Item = io::Result<&'static [u8]>> + Unpin {
        stream::iter(parts.iter().copied().map(Ok).collect::<Vec<_>>())
    }

    async fn read_all(dir: &ChunkDir, store: &ChunkStore, total: u64) -> Vec<u8> {
        let mut readers = store.open_in_order(dir, total).await.unwrap();
        let mut out = Vec::new();
        while let Some(file) = readers.next().await {
            file.unwrap().read_to_end(&mut out).await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn test_write_and_commit_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let dir = store.allocate("session-a").await.unwrap();

        assert!(!store.has_chunk(&dir, 0).await.unwrap());

        let staged = store
            .write_chunk(&dir, 0, body(&[b"hello", b" world"]), 64)
            .await
            .unwrap();
        assert_eq!(staged.len(), 11);
        assert_eq!(staged.sha256().len(), 64);

        // Not visible before commit
        assert!(!store.has_chunk(&dir, 0).await.unwrap());

        assert_eq!(staged.commit().await.unwrap(), 11);
        assert_eq!(store.chunk_len(&dir, 0).await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_discard_leaves_previous_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let dir = store.allocate("session-b").await.unwrap();

        let first = store.write_chunk(&dir, 0, body(&[b"abcde"]), 5).await.unwrap();
        first.commit().await.unwrap();

        let second = store.write_chunk(&dir, 0, body(&[b"xy"]), 5).await.unwrap();
        second.discard().await;

        assert_eq!(store.chunk_len(&dir, 0).await.unwrap(), Some(5));
        assert_eq!(read_all(&dir, &store, 1).await, b"abcde");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_write_stops_past_limit() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let dir = store.allocate("session-c").await.unwrap();

        let staged = store
            .write_chunk(&dir, 0, body(&[b"aaaa", b"bbbb", b"cccc", b"dddd"]), 5)
            .await
            .unwrap();

        // Reading stopped after the second frame pushed past the limit
        assert_eq!(staged.len(), 8);
        staged.discard().await;
        assert!(!store.has_chunk(&dir, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let dir = store.allocate("session-d").await.unwrap();

        let failing = stream::iter(vec![
            Ok(&b"abc"[..]),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        let result = store.write_chunk(&dir, 3, failing, 5).await;
        assert!(matches!(result, Err(UploadError::Io(_))));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_open_in_order_assembles() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let dir = store.allocate("session-e").await.unwrap();

        // Commit out of order
        for (index, part) in [(2u64, &b"!"[..]), (0, &b"Hello"[..]), (1, &b", you"[..])] {
            let staged = store
                .write_chunk(&dir, index, stream::iter(vec![Ok(part)]), 5)
                .await
                .unwrap();
            staged.commit().await.unwrap();
        }

        assert_eq!(read_all(&dir, &store, 3).await, b"Hello, you!");
    }

    #[tokio::test]
    async fn test_open_in_order_reports_missing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let dir = store.allocate("session-f").await.unwrap();

        let staged = store.write_chunk(&dir, 1, body(&[b"x"]), 5).await.unwrap();
        staged.commit().await.unwrap();

        let result = store.open_in_order(&dir, 3).await;
        assert!(matches!(result, Err(UploadError::IncompleteSet(ref m)) if m == &vec![0, 2]));
    }

    #[tokio::test]
    async fn test_inventory_ignores_staging_and_stray_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let dir = store.allocate("session-h").await.unwrap();

        for (index, part) in [(0u64, &b"abcde"[..]), (1, &b"fghij"[..]), (7, &b"zz"[..])] {
            let staged = store
                .write_chunk(&dir, index, stream::iter(vec![Ok(part)]), 5)
                .await
                .unwrap();
            staged.commit().await.unwrap();
        }
        // Uncommitted bytes do not count
        let _pending = store.write_chunk(&dir, 2, body(&[b"kl"]), 5).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let inventory = store.inventory(&dir, 3).await.unwrap();
        assert_eq!(inventory, Inventory { chunks: 2, bytes: 10 });
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().to_path_buf());
        let dir = store.allocate("session-g").await.unwrap();

        let staged = store.write_chunk(&dir, 0, body(&[b"x"]), 5).await.unwrap();
        staged.commit().await.unwrap();

        store.destroy(&dir).await.unwrap();
        assert!(!dir.path().exists());
        store.destroy(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_dirs_lists_directories_only() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::new(temp_dir.path().join("chunks"));

        assert!(store.session_dirs().await.unwrap().is_empty());

        store.allocate("one").await.unwrap();
        store.allocate("two").await.unwrap();
        std::fs::write(temp_dir.path().join("chunks").join("stray.txt"), b"x").unwrap();

        let mut names: Vec<_> = store
            .session_dirs()
            .await
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["one", "two"]);
    }
}
