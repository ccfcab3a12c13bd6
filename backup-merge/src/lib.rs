//! Backup Merge Library
//!
//! Collapses a chain of one full backup and its PAGE/DELTA incrementals into
//! a single full backup, resumably and with a pool of worker threads.

pub mod catalog;
pub mod codec;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod merge;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use merge::{do_merge, MergeOptions};
pub use utils::errors::MergeError;
pub type Result<T> = std::result::Result<T, MergeError>;
