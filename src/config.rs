//! Configuration management for the upload server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{AppError, Result};
use crate::upload::{
    CoordinatorConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, REAPER_INTERVAL_SECS, SESSION_EXPIRY_HOURS,
};

/// Ten years; keeps `chrono::Duration` arithmetic in range
const MAX_SESSION_TTL_HOURS: i64 = 10 * 365 * 24;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory completed uploads are written under
    pub root: PathBuf,
    /// Byte limit for everything under `root` (None = unlimited)
    pub quota_bytes: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Directory holding per-session chunk directories
    pub temp_dir: PathBuf,
    pub chunk_size: u64,
    pub max_chunk_size: u64,
    pub session_ttl_hours: i64,
    pub reaper_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            storage: StorageConfig {
                root: PathBuf::from("./data"),
                quota_bytes: None,
            },
            database: DatabaseConfig {
                url: "sqlite:./uploads.db".to_string(),
            },
            upload: UploadConfig::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            temp_dir: env::temp_dir().join("resumable-uploads"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            session_ttl_hours: SESSION_EXPIRY_HOURS,
            reaper_interval_secs: REAPER_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults for
    /// unset variables. Set-but-unparseable values are errors.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var("SERVER_PORT")?.unwrap_or(defaults.server.port),
            },
            storage: StorageConfig {
                root: env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.root),
                quota_bytes: parse_var("STORAGE_QUOTA_BYTES")?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
            },
            upload: UploadConfig {
                temp_dir: env::var("UPLOAD_TEMP_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.upload.temp_dir),
                chunk_size: parse_var("UPLOAD_CHUNK_SIZE")?.unwrap_or(defaults.upload.chunk_size),
                max_chunk_size: parse_var("UPLOAD_MAX_CHUNK_SIZE")?
                    .unwrap_or(defaults.upload.max_chunk_size),
                session_ttl_hours: parse_var("UPLOAD_SESSION_TTL_HOURS")?
                    .unwrap_or(defaults.upload.session_ttl_hours),
                reaper_interval_secs: parse_var("UPLOAD_REAPER_INTERVAL_SECS")?
                    .unwrap_or(defaults.upload.reaper_interval_secs),
            },
        };

        config.upload.validate()?;
        Ok(config)
    }
}

impl UploadConfig {
    /// Coordinator tunables derived from this section
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            default_chunk_size: self.chunk_size,
            max_chunk_size: self.max_chunk_size,
            session_ttl: chrono::Duration::hours(self.session_ttl_hours),
        }
    }

    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reaper_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > self.max_chunk_size {
            return Err(AppError::Config {
                key: "UPLOAD_CHUNK_SIZE",
                value: self.chunk_size.to_string(),
                reason: format!("must be between 1 and {}", self.max_chunk_size),
            });
        }
        if !(1..=MAX_SESSION_TTL_HOURS).contains(&self.session_ttl_hours) {
            return Err(AppError::Config {
                key: "UPLOAD_SESSION_TTL_HOURS",
                value: self.session_ttl_hours.to_string(),
                reason: format!("must be between 1 and {}", MAX_SESSION_TTL_HOURS),
            });
        }
        if self.reaper_interval_secs == 0 {
            return Err(AppError::Config {
                key: "UPLOAD_REAPER_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T>(key: &'static str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| AppError::Config {
                key,
                reason: e.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.upload.validate().is_ok());
        assert_eq!(config.upload.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.upload.session_ttl_hours, 24);
    }

    #[test]
    fn test_rejects_oversized_default_chunk() {
        let upload = UploadConfig {
            chunk_size: MAX_CHUNK_SIZE + 1,
            ..UploadConfig::default()
        };
        assert!(matches!(
            upload.validate(),
            Err(AppError::Config { key: "UPLOAD_CHUNK_SIZE", .. })
        ));
    }

    #[test]
    fn test_coordinator_config_follows_upload_section() {
        let upload = UploadConfig {
            chunk_size: 1024,
            session_ttl_hours: 2,
            ..UploadConfig::default()
        };
        let coordinator = upload.coordinator_config();
        assert_eq!(coordinator.default_chunk_size, 1024);
        assert_eq!(coordinator.max_chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(coordinator.session_ttl, chrono::Duration::hours(2));
        assert_eq!(upload.reaper_interval().as_secs(), REAPER_INTERVAL_SECS);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let upload = UploadConfig {
            reaper_interval_secs: 0,
            ..UploadConfig::default()
        };
        assert!(upload.validate().is_err());
    }
}
