//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::upload::UploadCoordinator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    coordinator: UploadCoordinator,
}

impl AppState {
    pub fn new(config: Config, db: SqlitePool, coordinator: UploadCoordinator) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                coordinator,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the upload coordinator
    pub fn coordinator(&self) -> &UploadCoordinator {
        &self.inner.coordinator
    }
}
