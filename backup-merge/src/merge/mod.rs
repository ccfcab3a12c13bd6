//! Merge engine: collapses a full backup and its incrementals into one
//! full backup.
//!
//! - [`chain`] resolves the chain and drives it pair by pair
//! - [`pair`] is the resumable per-pair state machine
//! - [`executor`] merges the files of a pair on a pool of threads
//! - [`planner`] decides and performs the merge of a single file
//! - [`extra_dirs`] aligns auxiliary-directory numbering between backups

pub mod chain;
pub mod executor;
pub mod extra_dirs;
pub mod pair;
pub mod planner;
pub mod progress;

pub use chain::do_merge;
pub use pair::{merge_backups, MergePhase};

/// Default size of one WAL segment
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Knobs for one merge run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// Worker threads for the file merge (at least 1)
    pub threads: usize,
    /// Log every processed file
    pub progress: bool,
    /// Used to compute the archived WAL size of non-stream backups
    pub wal_segment_size: u64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            progress: false,
            wal_segment_size: DEFAULT_WAL_SEGMENT_SIZE,
        }
    }
}
