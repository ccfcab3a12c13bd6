//! Fork-join worker pool that merges the files of one backup pair.

use super::planner::{classify, merge_file, MergeAction, MergeContext};
use super::progress::MergeProgress;
use crate::catalog::{ClaimSet, FileEntry, Manifest};
use crate::utils::{MergeError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Outcome of one executor run
#[derive(Debug, Default)]
pub struct ExecutorReport {
    /// Merged metadata per source manifest index, ascending by index
    pub updates: Vec<(usize, FileEntry)>,
    /// Workers that saw at least one failed file
    pub failed_workers: usize,
}

impl ExecutorReport {
    pub fn is_ok(&self) -> bool {
        self.failed_workers == 0
    }
}

#[derive(Debug, Default)]
struct WorkerOutcome {
    updates: Vec<(usize, FileEntry)>,
    failed: bool,
    interrupted: bool,
}

/// Merge every entry of `files` into the destination using `threads` workers.
///
/// Each entry is processed by whichever worker claims it first. A worker
/// that fails a file keeps draining the remaining claims; cancellation
/// aborts the whole run with [`MergeError::Interrupted`].
pub fn run(
    ctx: &MergeContext<'_>,
    files: &Manifest,
    claims: &ClaimSet,
    threads: usize,
    progress: &MergeProgress,
    cancel: &CancellationToken,
) -> Result<ExecutorReport> {
    let threads = threads.max(1);

    let outcomes: Vec<WorkerOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|id| {
                debug!("Start thread: {}", id);
                scope.spawn(move || worker(ctx, files, claims, progress, cancel))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(id, handle)| {
                handle.join().unwrap_or_else(|_| {
                    error!("Merge thread {} panicked", id);
                    WorkerOutcome {
                        failed: true,
                        ..WorkerOutcome::default()
                    }
                })
            })
            .collect()
    });

    if outcomes.iter().any(|o| o.interrupted) {
        return Err(MergeError::Interrupted);
    }

    let mut report = ExecutorReport::default();
    for outcome in outcomes {
        if outcome.failed {
            report.failed_workers += 1;
        }
        report.updates.extend(outcome.updates);
    }
    report.updates.sort_unstable_by_key(|(index, _)| *index);
    Ok(report)
}

fn worker(
    ctx: &MergeContext<'_>,
    files: &Manifest,
    claims: &ClaimSet,
    progress: &MergeProgress,
    cancel: &CancellationToken,
) -> WorkerOutcome {
    let mut outcome = WorkerOutcome::default();

    for (index, entry) in files.entries().iter().enumerate() {
        if !claims.try_claim(index) {
            continue;
        }
        if cancel.is_cancelled() {
            outcome.interrupted = true;
            break;
        }
        // Created before the workers start
        if entry.is_dir() {
            continue;
        }

        progress.file_started(index, &entry.path);
        match merge_file(ctx, entry) {
            Ok(merged) => {
                let written = match classify(entry) {
                    MergeAction::Skip => 0,
                    _ => merged.write_size.unwrap_or(0),
                };
                progress.file_done(written);
                outcome.updates.push((index, merged));
            }
            Err(e) => {
                error!("Cannot merge file \"{}\": {}", entry.path, e);
                outcome.failed = true;
            }
        }
    }

    outcome
}
