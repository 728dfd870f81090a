//! Upload types for resumable chunked uploads

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 5MB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Largest chunk size a client may request: 64MB
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Session expiry time: 24 hours
pub const SESSION_EXPIRY_HOURS: i64 = 24;

/// Reaper sweep interval: 1 hour
pub const REAPER_INTERVAL_SECS: u64 = 60 * 60;

/// Attempts at creating a session before giving up on id collisions
pub const CREATE_ATTEMPTS: usize = 3;

/// Number of chunks needed to carry `total_size` bytes in `chunk_size` pieces.
pub fn chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

/// Generate a new opaque session id (128 random bits, lowercase hex).
pub fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Whether `s` has the shape of an id produced by [`new_session_id`]
pub fn is_session_id(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// ============================================================================
// Request Types
// ============================================================================

/// Request to start a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUploadRequest {
    /// Original file name
    pub filename: String,

    /// Destination path, relative to the storage root
    pub path: String,

    /// Total file size in bytes
    pub size: u64,

    /// Optional: chunk size (defaults to the server's configured size)
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    /// Unique session ID
    pub id: String,

    /// Original file name
    pub filename: String,

    /// Destination path, relative to the storage root
    pub target_path: String,

    /// Total file size in bytes
    pub total_size: u64,

    /// Size of every chunk except possibly the last
    pub chunk_size: u64,

    /// Number of chunks the file is split into
    pub total_chunks: u64,

    /// Distinct chunk indices accepted so far
    pub uploaded_chunks: u64,

    /// Bytes currently held by the accepted chunks
    pub uploaded_bytes: u64,

    /// Current status
    pub status: SessionStatus,

    /// Chunk directory for this session
    pub temp_dir: String,

    /// SHA-256 of the assembled file, once completed
    pub sha256: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new session with zero progress
    pub fn new(
        id: String,
        filename: String,
        target_path: String,
        total_size: u64,
        chunk_size: u64,
        temp_dir: String,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();

        Self {
            id,
            filename,
            target_path,
            total_size,
            chunk_size,
            total_chunks: chunk_count(total_size, chunk_size),
            uploaded_chunks: 0,
            uploaded_bytes: 0,
            status: SessionStatus::Uploading,
            temp_dir,
            sha256: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Check if session has expired
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Check if every chunk slot has been filled
    pub fn all_chunks_present(&self) -> bool {
        self.uploaded_chunks == self.total_chunks
    }

    /// Index of the final (possibly short) chunk
    pub fn last_index(&self) -> u64 {
        self.total_chunks - 1
    }

    /// Bytes left for the final chunk once every other chunk is full
    pub fn last_chunk_size(&self) -> u64 {
        self.total_size - self.last_index() * self.chunk_size
    }

    /// Length rule for the chunk at `index`.
    ///
    /// The last chunk may be short but never longer than what remains of the
    /// file, which keeps `uploaded_bytes <= total_size`.
    pub fn expected_len(&self, index: u64) -> ChunkLen {
        if index < self.last_index() {
            ChunkLen::Exact(self.chunk_size)
        } else {
            ChunkLen::UpTo(self.last_chunk_size())
        }
    }

    /// Calculate progress percentage
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.uploaded_bytes as f64 / self.total_size as f64) * 100.0
    }

    /// Slide the idle window forward from `now`
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.updated_at = now;
        self.expires_at = now + ttl;
    }

    /// Client-facing view of this session
    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            filename: self.filename.clone(),
            target_path: self.target_path.clone(),
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
            uploaded_chunks: self.uploaded_chunks,
            uploaded_bytes: self.uploaded_bytes,
            status: self.status,
            progress: self.progress(),
            sha256: self.sha256.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
        }
    }
}

/// Length rule for a single chunk slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLen {
    /// Non-terminal chunks carry exactly this many bytes
    Exact(u64),
    /// The terminal chunk carries between 1 and this many bytes
    UpTo(u64),
}

impl ChunkLen {
    pub fn admits(self, len: u64) -> bool {
        match self {
            Self::Exact(n) => len == n,
            Self::UpTo(n) => len > 0 && len <= n,
        }
    }

    /// Most bytes worth reading before the chunk is known to be invalid
    pub fn max(self) -> u64 {
        match self {
            Self::Exact(n) | Self::UpTo(n) => n,
        }
    }
}

impl std::fmt::Display for ChunkLen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exact(n) => write!(f, "exactly {} bytes", n),
            Self::UpTo(n) => write!(f, "between 1 and {} bytes", n),
        }
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Receiving chunks
    Uploading,
    /// File assembled at its target path
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Completed => "completed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            other => Err(UploadError::Internal(format!(
                "Unknown session status: {}",
                other
            ))),
        }
    }
}

/// Session descriptor returned by every upload operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub id: String,
    pub filename: String,
    pub target_path: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub uploaded_chunks: u64,
    pub uploaded_bytes: u64,
    pub status: SessionStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session expired: {0}")]
    Expired(String),

    #[error("Session already completed: {0}")]
    AlreadyCompleted(String),

    #[error("Upload corrupted: expected total size {expected}, got {actual}")]
    CorruptedAssembly { expected: u64, actual: u64 },

    #[error("Missing chunks: {0:?}")]
    IncompleteSet(Vec<u64>),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Session already exists: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Expired(_) => StatusCode::GONE,
            Self::AlreadyCompleted(_) => StatusCode::CONFLICT,
            Self::CorruptedAssembly { .. } => StatusCode::CONFLICT,
            Self::IncompleteSet(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::QuotaExceeded(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::Expired(_) => "SESSION_EXPIRED",
            Self::AlreadyCompleted(_) => "SESSION_COMPLETED",
            Self::CorruptedAssembly { .. } => "CORRUPTED_ASSEMBLY",
            Self::IncompleteSet(_) => "INCOMPLETE_CHUNK_SET",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Conflict(_) => "SESSION_CONFLICT",
            Self::Io(_) => "STORAGE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
