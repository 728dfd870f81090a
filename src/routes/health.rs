//! Health check

use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::Result;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// GET /health
///
/// Healthy when the registry answers and the storage root is reachable.
pub async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    sqlx::query("SELECT 1").execute(state.db()).await?;
    tokio::fs::metadata(&state.config().storage.root).await?;

    Ok(Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::test_app;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_ok() {
        let (app, _h) = test_app().await;

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_missing_storage_root() {
        let (app, h) = test_app().await;
        std::fs::remove_dir_all(h.storage_root()).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
