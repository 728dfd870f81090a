//! Resumable Upload Server
//!
//! Accepts large files as independently submitted chunks over HTTP and
//! assembles them at a target path once every chunk has arrived.
//!
//! # Modules
//!
//! - `upload`: Sessions, chunk storage, assembly and expiry
//! - `storage`: Target filesystem and quota gate for completed files
//! - `db`: SQLite-backed session registry
//! - `routes`: HTTP endpoints

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;
