//! Upload Routes
//!
//! HTTP endpoints for resumable chunked uploads.
//!
//! Endpoints:
//! - POST /api/v1/uploads - Start an upload session
//! - PATCH /api/v1/uploads/:session_id?chunk=N - Upload one chunk (raw body)
//! - GET /api/v1/uploads/:session_id - Get session progress
//! - DELETE /api/v1/uploads/:session_id - Cancel upload

use std::io;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::state::AppState;
use crate::upload::{CreateUploadRequest, SessionDescriptor, UploadError};

/// Optional hex SHA-256 of the chunk body, verified before the chunk is kept
pub const CHUNK_SHA256_HEADER: &str = "x-chunk-sha256";

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(code = self.code(), "Upload failed: {}", self);
        } else {
            tracing::debug!(code = self.code(), "Upload rejected: {}", self);
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new().route("/", post(create_upload)).route(
        "/:session_id",
        get(get_progress).patch(upload_chunk).delete(cancel_upload),
    )
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/uploads
///
/// Start a new upload. Returns the session descriptor.
async fn create_upload(
    State(state): State<AppState>,
    payload: Result<Json<CreateUploadRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionDescriptor>), UploadError> {
    let Json(request) = payload.map_err(|e| UploadError::Validation(e.body_text()))?;

    let descriptor = state.coordinator().create_upload(request).await?;

    Ok((StatusCode::CREATED, Json(descriptor)))
}

#[derive(Debug, Deserialize)]
struct ChunkQuery {
    chunk: Option<String>,
}

/// PATCH /api/v1/uploads/:session_id?chunk=N
///
/// Upload one chunk as the raw request body. Chunks may arrive in any order
/// and may be resent; the chunk completing the set assembles the file.
async fn upload_chunk(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ChunkQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<SessionDescriptor>, UploadError> {
    let chunk_index = parse_chunk_index(query.chunk.as_deref())?;

    let expected_sha256 = headers
        .get(CHUNK_SHA256_HEADER)
        .map(|value| {
            value.to_str().map_err(|_| {
                UploadError::Validation(format!("{} is not valid text", CHUNK_SHA256_HEADER))
            })
        })
        .transpose()?;

    let stream = body.into_data_stream().map(|frame| frame.map_err(io::Error::other));

    let descriptor = state
        .coordinator()
        .accept_chunk(&session_id, chunk_index, stream, expected_sha256)
        .await?;

    Ok(Json(descriptor))
}

/// GET /api/v1/uploads/:session_id
async fn get_progress(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDescriptor>, UploadError> {
    let descriptor = state.coordinator().get_progress(&session_id).await?;
    Ok(Json(descriptor))
}

/// DELETE /api/v1/uploads/:session_id
async fn cancel_upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, UploadError> {
    state.coordinator().cancel(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn parse_chunk_index(raw: Option<&str>) -> Result<u64, UploadError> {
    let raw = raw.ok_or_else(|| UploadError::Validation("missing chunk query parameter".to_string()))?;
    raw.trim()
        .parse()
        .map_err(|_| UploadError::Validation(format!("invalid chunk index: {:?}", raw)))
}

// ============================================================================
// Tests
// ============================================================================
