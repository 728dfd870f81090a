//! Upload Coordinator
//!
//! Drives every session through `Uploading -> Completed`:
//! - Creates sessions and their chunk directories
//! - Validates and stores incoming chunks under the session's lock
//! - Assembles the target file once every chunk is present
//! - Tears sessions down on cancel or expiry

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::Stream;

use super::chunk_store::{ChunkDir, ChunkStore};
use super::locks::SessionLocks;
use super::registry::SessionRegistry;
use super::types::{
    new_session_id, CreateUploadRequest, SessionDescriptor, SessionStatus, UploadError,
    UploadSession, CREATE_ATTEMPTS, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, SESSION_EXPIRY_HOURS,
};
use crate::storage::{QuotaGate, TargetFs};

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Chunk size used when the client does not pick one
    pub default_chunk_size: u64,
    /// Largest chunk size a client may pick
    pub max_chunk_size: u64,
    /// Idle window before a session may be reaped
    pub session_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            session_ttl: Duration::hours(SESSION_EXPIRY_HOURS),
        }
    }
}

// ============================================================================
// Upload Coordinator
// ============================================================================

/// Entry point for every upload operation
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    registry: Arc<dyn SessionRegistry>,
    chunks: ChunkStore,
    target: TargetFs,
    quota: Arc<dyn QuotaGate>,
    locks: SessionLocks,
    config: CoordinatorConfig,
}

impl UploadCoordinator {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        chunks: ChunkStore,
        target: TargetFs,
        quota: Arc<dyn QuotaGate>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                chunks,
                target,
                quota,
                locks: SessionLocks::new(),
                config,
            }),
        }
    }

    pub(crate) fn chunks(&self) -> &ChunkStore {
        &self.inner.chunks
    }

    pub(crate) fn registry(&self) -> &dyn SessionRegistry {
        self.inner.registry.as_ref()
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Start a new upload
    pub async fn create_upload(
        &self,
        request: CreateUploadRequest,
    ) -> Result<SessionDescriptor, UploadError> {
        let chunk_size = self.validate_create(&request)?;

        self.inner.quota.check(request.size).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let id = new_session_id();
            let _guard = self.inner.locks.lock(&id).await;

            let dir = self.inner.chunks.allocate(&id).await?;
            let session = UploadSession::new(
                id.clone(),
                request.filename.clone(),
                request.path.clone(),
                request.size,
                chunk_size,
                dir.path().to_string_lossy().into_owned(),
                self.inner.config.session_ttl,
            );

            match self.inner.registry.create(&session).await {
                Ok(()) => {
                    tracing::info!(
                        session_id = %id,
                        filename = %session.filename,
                        target_path = %session.target_path,
                        total_size = session.total_size,
                        total_chunks = session.total_chunks,
                        "Created upload session"
                    );
                    return Ok(session.descriptor());
                }
                // The directory belongs to whoever already owns this id
                Err(UploadError::Conflict(_)) if attempt < CREATE_ATTEMPTS => {
                    tracing::warn!(session_id = %id, attempt = attempt, "Session id collision, retrying");
                }
                Err(UploadError::Conflict(id)) => return Err(UploadError::Conflict(id)),
                Err(e) => {
                    self.discard_dir(&id, &dir).await;
                    return Err(e);
                }
            }
        }
    }

    /// Store one chunk of an upload, assembling the file when it is the last
    /// one missing.
    pub async fn accept_chunk<S, B>(
        &self,
        session_id: &str,
        chunk_index: u64,
        body: S,
        expected_sha256: Option<&str>,
    ) -> Result<SessionDescriptor, UploadError>
    where
        S: Stream<Item = io::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        let _guard = self.inner.locks.lock(session_id).await;
        let now = Utc::now();

        let mut session = self.inner.registry.get(session_id).await?;

        if session.is_expired_at(now) {
            return Err(UploadError::Expired(session_id.to_string()));
        }
        if session.status == SessionStatus::Completed {
            return Err(UploadError::AlreadyCompleted(session_id.to_string()));
        }
        if chunk_index >= session.total_chunks {
            return Err(UploadError::Validation(format!(
                "Chunk index {} out of range (0..{})",
                chunk_index, session.total_chunks
            )));
        }

        let dir = ChunkDir::from_path(&session.temp_dir);
        let rule = session.expected_len(chunk_index);
        let was_present = self.inner.chunks.has_chunk(&dir, chunk_index).await?;

        let staged = self
            .inner
            .chunks
            .write_chunk(&dir, chunk_index, body, rule.max())
            .await?;

        if !rule.admits(staged.len()) {
            let len = staged.len();
            staged.discard().await;
            return Err(UploadError::Validation(format!(
                "Invalid chunk size for chunk {}: expected {}, got {}",
                chunk_index, rule, len
            )));
        }

        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(staged.sha256()) {
                let actual = staged.sha256().to_string();
                staged.discard().await;
                return Err(UploadError::Validation(format!(
                    "Checksum mismatch for chunk {}: expected {}, got {}",
                    chunk_index, expected, actual
                )));
            }
        }

        let len = staged.commit().await?;

        if was_present {
            // Counters follow what is on disk, which also picks up chunks
            // committed before a crash but never counted.
            let inventory = self.inner.chunks.inventory(&dir, session.total_chunks).await?;
            session.uploaded_chunks = inventory.chunks;
            session.uploaded_bytes = inventory.bytes;
        } else {
            session.uploaded_chunks += 1;
            session.uploaded_bytes += len;
        }
        session.touch(now, self.inner.config.session_ttl);
        self.inner.registry.update(&session).await?;

        tracing::debug!(
            session_id = %session_id,
            chunk_index = chunk_index,
            bytes = len,
            resubmitted = was_present,
            uploaded_chunks = session.uploaded_chunks,
            total_chunks = session.total_chunks,
            "Accepted chunk"
        );

        if session.all_chunks_present() {
            if session.uploaded_bytes != session.total_size {
                tracing::warn!(
                    session_id = %session_id,
                    expected = session.total_size,
                    actual = session.uploaded_bytes,
                    "All chunks present but sizes do not add up"
                );
                return Err(UploadError::CorruptedAssembly {
                    expected: session.total_size,
                    actual: session.uploaded_bytes,
                });
            }

            self.finalize(&mut session, &dir).await?;
        }

        Ok(session.descriptor())
    }

    /// Current state of an upload
    pub async fn get_progress(&self, session_id: &str) -> Result<SessionDescriptor, UploadError> {
        Ok(self.inner.registry.get(session_id).await?.descriptor())
    }

    /// Abandon an upload, discarding every stored chunk
    pub async fn cancel(&self, session_id: &str) -> Result<(), UploadError> {
        let _guard = self.inner.locks.lock(session_id).await;

        let session = self.inner.registry.get(session_id).await?;
        self.discard_dir(session_id, &ChunkDir::from_path(&session.temp_dir))
            .await;
        self.inner.registry.delete(session_id).await?;

        tracing::info!(session_id = %session_id, "Cancelled upload session");

        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Remove a session if it is still expired once its lock is held.
    ///
    /// Returns whether anything was removed.
    pub(crate) async fn reap_if_expired(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, UploadError> {
        let _guard = self.inner.locks.lock(session_id).await;

        let session = match self.inner.registry.get(session_id).await {
            Ok(session) => session,
            Err(UploadError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        // Refreshed by a chunk that landed after the expiry listing
        if !session.is_expired_at(now) {
            return Ok(false);
        }

        self.inner
            .chunks
            .destroy(&ChunkDir::from_path(&session.temp_dir))
            .await?;
        self.inner.registry.delete(session_id).await?;

        tracing::info!(
            session_id = %session_id,
            status = session.status.as_str(),
            expired_at = %session.expires_at,
            "Reaped expired upload session"
        );

        Ok(true)
    }

    /// Remove a chunk directory that has no registry record.
    ///
    /// Returns whether the directory was removed.
    pub(crate) async fn reap_orphan(
        &self,
        session_id: &str,
        dir: &ChunkDir,
    ) -> Result<bool, UploadError> {
        let _guard = self.inner.locks.lock(session_id).await;

        match self.inner.registry.get(session_id).await {
            Ok(_) => Ok(false),
            Err(UploadError::NotFound(_)) => {
                self.inner.chunks.destroy(dir).await?;
                tracing::info!(session_id = %session_id, "Removed orphaned chunk directory");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn validate_create(&self, request: &CreateUploadRequest) -> Result<u64, UploadError> {
        if request.filename.trim().is_empty() {
            return Err(UploadError::Validation("filename must not be empty".to_string()));
        }
        if request.path.trim().is_empty() {
            return Err(UploadError::Validation("path must not be empty".to_string()));
        }
        if request.size == 0 {
            return Err(UploadError::Validation("size must be positive".to_string()));
        }
        if request.size > i64::MAX as u64 {
            return Err(UploadError::Validation(format!("size too large: {}", request.size)));
        }

        let chunk_size = request
            .chunk_size
            .unwrap_or(self.inner.config.default_chunk_size);
        if chunk_size == 0 || chunk_size > self.inner.config.max_chunk_size {
            return Err(UploadError::Validation(format!(
                "chunkSize must be between 1 and {} bytes, got {}",
                self.inner.config.max_chunk_size, chunk_size
            )));
        }

        self.inner.target.resolve(&request.path)?;

        Ok(chunk_size)
    }

    /// Assemble the target file and mark the session completed.
    ///
    /// On failure the session stays `Uploading` with its chunks intact, so
    /// resending any chunk assembles again.
    async fn finalize(&self, session: &mut UploadSession, dir: &ChunkDir) -> Result<(), UploadError> {
        self.inner.quota.check(session.total_size).await?;

        let parts = self
            .inner
            .chunks
            .open_in_order(dir, session.total_chunks)
            .await?;
        let written = self
            .inner
            .target
            .write_concatenated(&session.target_path, &session.id, parts)
            .await?;

        let mut completed = session.clone();
        completed.status = SessionStatus::Completed;
        completed.sha256 = Some(written.sha256.clone());
        completed.touch(Utc::now(), self.inner.config.session_ttl);

        if let Err(e) = self.inner.registry.update(&completed).await {
            tracing::warn!(
                session_id = %session.id,
                path = %written.path.display(),
                error = %e,
                "Assembled file written but session not marked completed; chunks kept for retry"
            );
            return Err(e);
        }
        *session = completed;

        self.discard_dir(&session.id, dir).await;

        tracing::info!(
            session_id = %session.id,
            path = %written.path.display(),
            bytes = written.bytes,
            "Completed upload"
        );

        Ok(())
    }

    /// Best-effort removal of a chunk directory
    async fn discard_dir(&self, session_id: &str, dir: &ChunkDir) {
        if let Err(e) = self.inner.chunks.destroy(dir).await {
            tracing::warn!(
                session_id = %session_id,
                path = %dir.path().display(),
                error = %e,
                "Failed to remove chunk directory"
            );
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
