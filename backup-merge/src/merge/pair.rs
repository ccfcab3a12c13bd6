//! Resumable merge of one (destination, source) backup pair.
//!
//! The destination `to` is the running full backup; the source `from` is its
//! immediate child. On success `to` holds the merged content under `from`'s
//! identifier and `from` is gone.
//!
//! Persisted statuses make every step restartable: MERGING on both backups
//! means validation already passed, DELETING on `from` means its content is
//! already folded into `to`.

use super::executor;
use super::extra_dirs::{reconcile, ReorderIntent, ReorderStage};
use super::planner::MergeContext;
use super::progress::MergeProgress;
use super::MergeOptions;
use crate::catalog::{extra_dir_path, BackupDescriptor, BackupStatus, Catalog, ClaimSet, Lsn, Manifest};
use crate::fs::{create_dir, remove_dir_with_files, remove_entry, walker};
use crate::utils::{MergeError, Result};
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Accounting unit charged for every directory entry
pub const DIRECTORY_BYTES: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    Validating,
    Preparing,
    Merging,
    Finalizing,
    DeletingSource,
    Done,
}

/// Fold `from` into `to`.
pub fn merge_backups(
    catalog: &Catalog,
    to: &mut BackupDescriptor,
    from: &mut BackupDescriptor,
    options: &MergeOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    PairMerge {
        catalog,
        options,
        cancel,
        to,
        from,
        to_files: Manifest::new(Vec::new()),
        files: Manifest::new(Vec::new()),
    }
    .run()
}

struct PairMerge<'a> {
    catalog: &'a Catalog,
    options: &'a MergeOptions,
    cancel: &'a CancellationToken,
    to: &'a mut BackupDescriptor,
    from: &'a mut BackupDescriptor,
    /// Destination manifest before the merge, sorted by path descending
    to_files: Manifest,
    /// Source manifest; becomes the merged manifest
    files: Manifest,
}

impl PairMerge<'_> {
    fn run(mut self) -> Result<()> {
        info!("Merging backup {} with backup {}", self.from.id(), self.to.id());

        let mut phase = MergePhase::Validating;
        loop {
            debug!(phase = ?phase, "Merge {} into {}", self.from.id(), self.to.id());
            phase = match phase {
                MergePhase::Validating => self.validate()?,
                MergePhase::Preparing => self.prepare()?,
                MergePhase::Merging => self.merge_files()?,
                MergePhase::Finalizing => self.finalize()?,
                MergePhase::DeletingSource => self.delete_source()?,
                MergePhase::Done => break,
            };
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<MergePhase> {
        // A MERGING destination is mid-mutation and was validated by the
        // attempt that set the status
        if self.to.status == BackupStatus::Ok {
            self.catalog.validate(self.to)?;
            if self.to.status == BackupStatus::Corrupt {
                return Err(MergeError::Corrupt(self.to.id().to_string()));
            }
        }

        self.to_files = self.catalog.read_manifest(self.to)?;
        self.to_files.sort_by_path_desc();

        if self.from.status == BackupStatus::Deleting {
            // Partially deleted; its content already lives in `to`
            self.files = self.catalog.read_manifest(self.to)?;
        } else {
            self.catalog.validate(self.from)?;
            if self.from.status == BackupStatus::Corrupt {
                return Err(MergeError::Corrupt(self.from.id().to_string()));
            }
            self.files = self.catalog.read_manifest(self.from)?;
        }
        self.files.sort_by_size();

        Ok(MergePhase::Preparing)
    }

    fn prepare(&mut self) -> Result<MergePhase> {
        if self.from.status == BackupStatus::Deleting {
            return Ok(MergePhase::DeletingSource);
        }

        self.to.status = BackupStatus::Merging;
        self.catalog.write_descriptor(self.to)?;
        self.from.status = BackupStatus::Merging;
        self.catalog.write_descriptor(self.from)?;

        create_dir(&self.catalog.database_path(self.to.id()))?;
        self.reconcile_extra_dirs()?;
        self.create_directories()?;

        Ok(MergePhase::Merging)
    }

    /// Move `to`'s auxiliary containers to `from`'s numbering and record the
    /// result, so that a restarted merge finds nothing left to reconcile.
    ///
    /// A reorder intent left by an interrupted attempt is resumed as is; it
    /// is removed only once `to`'s manifest and descriptor both reflect the
    /// new numbering.
    fn reconcile_extra_dirs(&mut self) -> Result<()> {
        let id = self.to.id();
        let mut intent = match self.catalog.read_reorder_intent::<ReorderIntent>(id)? {
            Some(intent) => {
                info!("Resume auxiliary directory reorder of backup {} ({:?})", id, intent.stage);
                intent
            }
            None if self.to.extra_dirs == self.from.extra_dirs => return Ok(()),
            None => {
                let intent = ReorderIntent::new(&self.to.extra_dir_list(), &self.from.extra_dir_list());
                self.catalog.write_reorder_intent(id, &intent)?;
                intent
            }
        };

        let catalog = self.catalog;
        reconcile(&catalog.extra_prefix(id), &mut intent, |recorded| {
            catalog.write_reorder_intent(id, recorded)
        })?;

        // Past this stage the persisted manifest already uses the new numbers
        if intent.stage < ReorderStage::Renumbered {
            let renumbering = &intent.renumbering;
            self.to_files.retain_mut(|entry| match renumbering.apply(entry.extra_dir_num) {
                Some(num) => {
                    entry.extra_dir_num = num;
                    true
                }
                None => false,
            });
            self.to_files.sort_by_path_desc();
            self.catalog.write_manifest(self.to, &self.to_files)?;

            intent.stage = ReorderStage::Renumbered;
            self.catalog.write_reorder_intent(id, &intent)?;
        }

        self.to.extra_dirs = self.from.extra_dirs.clone();
        self.catalog.write_descriptor(self.to)?;
        self.catalog.remove_reorder_intent(id)
    }

    fn create_directories(&self) -> Result<()> {
        let root = self.catalog.database_path(self.to.id());
        let prefix = self.catalog.extra_prefix(self.to.id());

        for (num, _) in self.from.extra_dir_list().iter() {
            create_dir(&extra_dir_path(&prefix, num))?;
        }
        for entry in self.files.entries().iter().filter(|e| e.is_dir()) {
            let base = match entry.extra_dir_num {
                0 => root.clone(),
                num => extra_dir_path(&prefix, num),
            };
            create_dir(&base.join(&entry.path))?;
        }
        Ok(())
    }

    fn merge_files(&mut self) -> Result<MergePhase> {
        let report = {
            let ctx = MergeContext::new(self.catalog, self.to, self.from, &self.to_files);
            let claims = ClaimSet::new(self.files.len());
            let progress = MergeProgress::new(self.files.len(), self.options.progress);

            let report = executor::run(&ctx, &self.files, &claims, self.options.threads, &progress, self.cancel)?;
            progress.log_summary();
            report
        };

        if !report.is_ok() {
            return Err(MergeError::MergeFailed(format!(
                "{} of {} threads failed",
                report.failed_workers,
                self.options.threads.max(1)
            )));
        }

        for (index, merged) in report.updates {
            if let Some(entry) = self.files.get_mut(index) {
                *entry = merged;
            }
        }
        Ok(MergePhase::Finalizing)
    }

    fn finalize(&mut self) -> Result<MergePhase> {
        let to = &mut *self.to;
        let from = &*self.from;

        to.status = BackupStatus::Ok;
        to.parent_backup = None;
        to.start_lsn = from.start_lsn;
        to.stop_lsn = from.stop_lsn;
        to.recovery_time = from.recovery_time;
        to.recovery_xid = from.recovery_xid;
        to.extra_dirs = from.extra_dirs.clone();
        to.stream = to.stream && from.stream;
        to.data_bytes = Some(data_bytes(&self.files));
        to.wal_bytes = if to.stream {
            None
        } else {
            wal_bytes(to.start_lsn, to.stop_lsn, self.options.wal_segment_size)
        };

        self.catalog.write_manifest(to, &self.files)?;
        self.catalog.write_descriptor(to)?;
        Ok(MergePhase::DeletingSource)
    }

    fn delete_source(&mut self) -> Result<MergePhase> {
        self.catalog.delete_backup_files(self.from)?;
        self.prune_stale_files()?;

        let to_path = self.catalog.backup_path(self.to.id());
        let from_path = self.catalog.backup_path(self.from.id());
        info!("Rename {} to {}", self.to.id(), self.from.id());
        fs::rename(&to_path, &from_path).map_err(|source| MergeError::RenameFailed {
            from: to_path,
            to: from_path,
            source,
        })?;

        self.to.start_time = self.from.start_time;
        self.catalog.write_descriptor(self.to)?;
        Ok(MergePhase::Done)
    }

    /// Delete everything in `to`'s trees that the merged manifest does not
    /// list, leaf-first. Directories go only once empty.
    fn prune_stale_files(&mut self) -> Result<()> {
        self.files.sort_by_path_desc();

        let root = self.catalog.database_path(self.to.id());
        self.prune_tree(&root, 0)?;

        let prefix = self.catalog.extra_prefix(self.to.id());
        let extra = self.to.extra_dir_list();
        let containers = match fs::read_dir(&prefix) {
            Ok(dir) => dir.collect::<std::io::Result<Vec<_>>>()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        for container in containers {
            let name = container.file_name().to_string_lossy().into_owned();
            let num = name
                .strip_prefix("externaldir")
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|&n| extra.path_of(n).is_some());
            match num {
                Some(num) => self.prune_tree(&container.path(), num)?,
                None => {
                    debug!("Deleted \"{}\"", container.path().display());
                    remove_dir_with_files(&container.path())?;
                }
            }
        }
        Ok(())
    }

    fn prune_tree(&self, base: &Path, extra_dir_num: usize) -> Result<()> {
        for info in walker::list_tree(base, true)? {
            if self.files.find(&info.relative_path, extra_dir_num).is_some() {
                continue;
            }
            if info.is_dir && !is_empty_dir(&info.path)? {
                continue;
            }
            remove_entry(&info.path)?;
            debug!("Deleted \"{}\"", info.path.display());
        }
        Ok(())
    }
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

/// Regular files count their stored bytes, directories a fixed unit.
pub fn data_bytes(files: &Manifest) -> u64 {
    files
        .entries()
        .iter()
        .map(|entry| {
            if entry.is_dir() {
                DIRECTORY_BYTES
            } else if entry.is_regular() {
                entry.write_size.unwrap_or(0)
            } else {
                0
            }
        })
        .sum()
}

/// Size of the archived WAL segments spanning `[start, stop]`.
pub fn wal_bytes(start: Lsn, stop: Lsn, segment_size: u64) -> Option<u64> {
    if segment_size == 0 {
        return None;
    }
    let segments = (stop.0 / segment_size).saturating_sub(start.0 / segment_size) + 1;
    Some(segment_size * segments)
}
