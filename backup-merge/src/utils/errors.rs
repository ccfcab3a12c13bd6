//! Custom error types for the merge engine.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Backup {0} is corrupt")]
    Corrupt(String),

    #[error("Merging of backup {0} failed")]
    MergeIncomplete(String),

    #[error("Data files merging failed: {0}")]
    MergeFailed(String),

    #[error("Could not rename \"{}\" to \"{}\": {source}", from.display(), to.display())]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Interrupted during merging backups")]
    Interrupted,

    #[error("Catalog is locked: {0}")]
    LockHeld(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MergeError {
    /// True for outcomes that leave the catalog in a state a re-run can resume.
    pub fn is_resumable(&self) -> bool {
        matches!(self, MergeError::MergeFailed(_) | MergeError::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;
