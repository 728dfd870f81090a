//! Upload session database operations

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use crate::upload::{SessionRegistry, UploadError, UploadSession};

/// Upload session row as stored
#[derive(Debug, Clone, sqlx::FromRow)]
struct SessionRow {
    id: String,
    filename: String,
    target_path: String,
    total_size: i64,
    chunk_size: i64,
    total_chunks: i64,
    uploaded_chunks: i64,
    uploaded_bytes: i64,
    status: String,
    temp_dir: String,
    sha256: Option<String>,
    created_at: String,
    updated_at: String,
    expires_at: String,
}

impl TryFrom<SessionRow> for UploadSession {
    type Error = UploadError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(UploadSession {
            total_size: from_sql_int("total_size", row.total_size)?,
            chunk_size: from_sql_int("chunk_size", row.chunk_size)?,
            total_chunks: from_sql_int("total_chunks", row.total_chunks)?,
            uploaded_chunks: from_sql_int("uploaded_chunks", row.uploaded_chunks)?,
            uploaded_bytes: from_sql_int("uploaded_bytes", row.uploaded_bytes)?,
            status: row.status.parse()?,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
            expires_at: parse_timestamp(&row.expires_at)?,
            id: row.id,
            filename: row.filename,
            target_path: row.target_path,
            temp_dir: row.temp_dir,
            sha256: row.sha256,
        })
    }
}

/// Format a timestamp for storage.
///
/// Fixed-width UTC RFC 3339 so that string order matches time order.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, UploadError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| UploadError::Internal(format!("Bad timestamp {:?}: {}", value, e)))
}

fn from_sql_int(column: &str, value: i64) -> Result<u64, UploadError> {
    u64::try_from(value)
        .map_err(|_| UploadError::Internal(format!("Negative {} in registry: {}", column, value)))
}

fn to_sql_int(column: &str, value: u64) -> Result<i64, UploadError> {
    i64::try_from(value)
        .map_err(|_| UploadError::Internal(format!("{} out of range: {}", column, value)))
}

/// SQLite-backed session registry
#[derive(Clone)]
pub struct SqliteSessionRegistry {
    pool: SqlitePool,
}

impl SqliteSessionRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Count all stored sessions
    pub async fn count(&self) -> Result<i64, UploadError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[async_trait::async_trait]
impl SessionRegistry for SqliteSessionRegistry {
    async fn create(&self, session: &UploadSession) -> Result<(), UploadError> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_sessions (
                id, filename, target_path, total_size, chunk_size, total_chunks,
                uploaded_chunks, uploaded_bytes, status, temp_dir, sha256,
                created_at, updated_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.filename)
        .bind(&session.target_path)
        .bind(to_sql_int("total_size", session.total_size)?)
        .bind(to_sql_int("chunk_size", session.chunk_size)?)
        .bind(to_sql_int("total_chunks", session.total_chunks)?)
        .bind(to_sql_int("uploaded_chunks", session.uploaded_chunks)?)
        .bind(to_sql_int("uploaded_bytes", session.uploaded_bytes)?)
        .bind(session.status.as_str())
        .bind(&session.temp_dir)
        .bind(&session.sha256)
        .bind(timestamp(session.created_at))
        .bind(timestamp(session.updated_at))
        .bind(timestamp(session.expires_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(UploadError::Conflict(session.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<UploadSession, UploadError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, filename, target_path, total_size, chunk_size, total_chunks,
                   uploaded_chunks, uploaded_bytes, status, temp_dir, sha256,
                   created_at, updated_at, expires_at
            FROM upload_sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| UploadError::NotFound(id.to_string()))?
            .try_into()
    }

    async fn update(&self, session: &UploadSession) -> Result<(), UploadError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_sessions
            SET uploaded_chunks = ?, uploaded_bytes = ?, status = ?, sha256 = ?,
                updated_at = ?, expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(to_sql_int("uploaded_chunks", session.uploaded_chunks)?)
        .bind(to_sql_int("uploaded_bytes", session.uploaded_bytes)?)
        .bind(session.status.as_str())
        .bind(&session.sha256)
        .bind(timestamp(session.updated_at))
        .bind(timestamp(session.expires_at))
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::NotFound(session.id.clone()));
        }

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), UploadError> {
        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<UploadSession>, UploadError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT id, filename, target_path, total_size, chunk_size, total_chunks,
                   uploaded_chunks, uploaded_bytes, status, temp_dir, sha256,
                   created_at, updated_at, expires_at
            FROM upload_sessions
            WHERE expires_at < ?
            ORDER BY expires_at ASC
            "#,
        )
        .bind(timestamp(now))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(UploadSession::try_from).collect()
    }
}
