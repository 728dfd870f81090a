//! Resumable Chunked Upload Module
//!
//! Accepts large files as independently submitted, fixed-size chunks:
//! - Sessions survive restarts in a durable registry
//! - Chunks may arrive in any order and may be resent
//! - The target file is assembled once every chunk is present
//! - Idle sessions are reaped in the background
//!
//! Protocol Flow:
//! 1. Client creates a session with file name, target path and size
//! 2. Client sends each chunk by index, in any order, retrying as needed
//! 3. The chunk that completes the set triggers assembly at the target path
//! 4. Client polls progress or cancels at any point

pub mod chunk_store;
pub mod coordinator;
pub mod locks;
pub mod reaper;
pub mod registry;
pub mod types;

pub use chunk_store::{ChunkDir, ChunkStore, Inventory, StagedChunk};
pub use coordinator::{CoordinatorConfig, UploadCoordinator};
pub use locks::{SessionGuard, SessionLocks};
pub use reaper::{ExpiryReaper, SweepReport};
pub use registry::SessionRegistry;
pub use types::*;
