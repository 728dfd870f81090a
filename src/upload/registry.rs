//! Session registry contract
//!
//! The registry is the single source of truth for upload progress. It must be
//! durable and shared by every server process, so it is reached through this
//! trait rather than held in memory; see `db::SqliteSessionRegistry`.

use chrono::{DateTime, Utc};

use super::types::{UploadError, UploadSession};

/// Durable keyed store of upload sessions
#[async_trait::async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Insert a new session. Fails with `Conflict` if the id is taken.
    async fn create(&self, session: &UploadSession) -> Result<(), UploadError>;

    /// Fetch a session, or `NotFound`.
    async fn get(&self, id: &str) -> Result<UploadSession, UploadError>;

    /// Persist the full record. Fails with `NotFound` if it was deleted.
    async fn update(&self, session: &UploadSession) -> Result<(), UploadError>;

    /// Remove a session. Succeeds if it is already gone.
    async fn delete(&self, id: &str) -> Result<(), UploadError>;

    /// All sessions whose `expires_at` is before `now`
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>, UploadError>;
}
