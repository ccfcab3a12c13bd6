//! Utility modules for the merge engine.

pub mod errors;
pub mod logger;

pub use errors::{MergeError, Result};
