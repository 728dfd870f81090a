//! Storage module for completed uploads
//!
//! The target filesystem that assembled files are written to, and the quota
//! gate consulted before accepting them.

mod quota;
mod target;

pub use quota::{DirectoryQuota, QuotaGate, Unlimited};
pub use target::{TargetFs, WrittenFile};
