//! Process-level plumbing for the merge binary.

pub mod shutdown;
