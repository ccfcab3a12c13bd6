//! Per-file merge decisions and their execution.
//!
//! Every entry of the source manifest is classified into one [`MergeAction`];
//! the action reads from the source tree and writes only the entry's own path
//! in the destination tree.

use crate::catalog::{extra_dir_path, BackupDescriptor, BackupMode, Catalog, ExtraDirs, FileEntry, Manifest};
use crate::codec::{
    backup_data_file, copy_control_file, copy_file, file_crc, file_size, restore_data_file, EncodeOptions,
    RestoreOptions, CONTROL_FILE_NAME,
};
use crate::fs::{create_dir, ScopedTempFile};
use crate::utils::{MergeError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Unchanged since the parent; only metadata is carried forward
    Skip,
    /// Overlay the stored pages onto the destination's copy
    BlockMerge,
    ControlFile,
    /// Copy into the container the destination numbers this directory with
    ExtraDirCopy,
    Copy,
}

/// Decide what to do with a non-directory source entry.
pub fn classify(entry: &FileEntry) -> MergeAction {
    if entry.is_unchanged() {
        MergeAction::Skip
    } else if entry.is_datafile && !entry.is_cfs {
        MergeAction::BlockMerge
    } else if entry.name() == CONTROL_FILE_NAME {
        MergeAction::ControlFile
    } else if entry.extra_dir_num != 0 {
        MergeAction::ExtraDirCopy
    } else {
        MergeAction::Copy
    }
}

/// Everything a worker needs to merge one file of a pair.
#[derive(Debug)]
pub struct MergeContext<'a> {
    pub to: &'a BackupDescriptor,
    pub from: &'a BackupDescriptor,
    /// Destination manifest before the merge, sorted by path descending
    pub to_files: &'a Manifest,
    pub from_extra: ExtraDirs,
    /// Destination auxiliary directories after reconciliation
    pub to_extra: ExtraDirs,
    to_root: PathBuf,
    from_root: PathBuf,
    to_extra_prefix: PathBuf,
    from_extra_prefix: PathBuf,
}

impl<'a> MergeContext<'a> {
    pub fn new(
        catalog: &Catalog,
        to: &'a BackupDescriptor,
        from: &'a BackupDescriptor,
        to_files: &'a Manifest,
    ) -> Self {
        Self {
            to,
            from,
            to_files,
            from_extra: from.extra_dir_list(),
            to_extra: to.extra_dir_list(),
            to_root: catalog.database_path(to.id()),
            from_root: catalog.database_path(from.id()),
            to_extra_prefix: catalog.extra_prefix(to.id()),
            from_extra_prefix: catalog.extra_prefix(from.id()),
        }
    }

    /// Root the source stores `entry` under.
    fn from_base(&self, entry: &FileEntry) -> PathBuf {
        match entry.extra_dir_num {
            0 => self.from_root.clone(),
            num => extra_dir_path(&self.from_extra_prefix, num),
        }
    }

    /// Root the destination stores `entry` under.
    ///
    /// Auxiliary numbers are only comparable through their paths, so the
    /// source number is translated into the destination's numbering.
    fn to_base(&self, entry: &FileEntry) -> Result<PathBuf> {
        if entry.extra_dir_num == 0 {
            return Ok(self.to_root.clone());
        }
        let path = self.from_extra.path_of(entry.extra_dir_num).ok_or_else(|| {
            MergeError::InvalidState(format!(
                "file \"{}\" refers to unknown auxiliary directory {} of backup {}",
                entry.path,
                entry.extra_dir_num,
                self.from.id()
            ))
        })?;
        let num = self.to_extra.number_of(path).ok_or_else(|| {
            MergeError::InvalidState(format!(
                "auxiliary directory \"{}\" is not known to backup {}",
                path,
                self.to.id()
            ))
        })?;
        Ok(extra_dir_path(&self.to_extra_prefix, num))
    }
}

/// Merge one non-directory entry and return its updated metadata.
pub fn merge_file(ctx: &MergeContext<'_>, entry: &FileEntry) -> Result<FileEntry> {
    let mut merged = entry.clone();
    let action = classify(entry);

    match action {
        MergeAction::Skip => {
            debug!("Skip merging file \"{}\", the file didn't change", entry.path);
            if let Some(old) = ctx.to_files.find(&entry.path, entry.extra_dir_num) {
                merged.compress_alg = old.compress_alg;
                merged.write_size = old.write_size;
                merged.crc = old.crc;
            }
            return Ok(merged);
        }
        MergeAction::BlockMerge => merge_data_file(ctx, entry, &mut merged)?,
        MergeAction::ControlFile => {
            let (size, crc) = copy_control_file(&ctx.from_base(entry), &ctx.to_base(entry)?, entry)?;
            merged.write_size = Some(size);
            merged.crc = crc;
        }
        MergeAction::ExtraDirCopy | MergeAction::Copy => {
            let (size, crc) = copy_file(&ctx.from_base(entry), &ctx.to_base(entry)?, entry)?;
            merged.write_size = Some(size);
            merged.crc = crc;
        }
    }

    // Record what is actually on disk now
    merged.compress_alg = ctx.to.compress_alg;

    if let Some(size) = merged.write_size {
        debug!("Merged file \"{}\": {} bytes", entry.path, size);
    }
    Ok(merged)
}

fn merge_data_file(ctx: &MergeContext<'_>, entry: &FileEntry, merged: &mut FileEntry) -> Result<()> {
    let from_path = ctx.from_base(entry).join(&entry.path);
    let to_path = ctx.to_base(entry)?.join(&entry.path);
    if let Some(parent) = to_path.parent() {
        create_dir(parent)?;
    }

    // Nothing stored for this file in the source: only truncation applies
    let source = entry.write_size.is_some().then_some(from_path.as_path());
    let truncate_blocks = match ctx.from.backup_mode {
        BackupMode::Delta => entry.n_blocks,
        _ => None,
    };

    debug!(
        "Merging file \"{}\", is_datafile {}, is_cfs {}",
        from_path.display(),
        entry.is_datafile,
        entry.is_cfs
    );

    if !ctx.to.compress_alg.is_compressed() {
        restore_data_file(
            &to_path,
            source,
            &RestoreOptions {
                compress_alg: entry.compress_alg,
                truncate_blocks,
                write_header: true,
                version: ctx.from.program_version(),
            },
        )?;
        merged.write_size = Some(file_size(&to_path)?);
        merged.crc = file_crc(&to_path)?;
        return Ok(());
    }

    // The stored copy in `to` is the only one a re-run can rebuild from, so
    // it is replaced by a rename and never rewritten in place.
    let decoded = ScopedTempFile::sibling(&to_path);
    materialize(ctx, entry, &to_path, source, truncate_blocks, decoded.path())?;

    debug!("Compress file and save it into \"{}\"", to_path.display());
    merged.size = file_size(decoded.path())?;
    let encoded = ScopedTempFile::sibling(&to_path);
    let stored = backup_data_file(
        decoded.path(),
        encoded.path(),
        &EncodeOptions {
            compress_alg: ctx.to.compress_alg,
            compress_level: ctx.to.compress_level,
            mode: ctx.to.backup_mode,
            start_lsn: ctx.to.start_lsn,
        },
    )?;
    encoded.persist(&to_path)?;
    decoded.remove()?;

    merged.write_size = Some(stored.write_size);
    merged.crc = stored.crc;
    merged.n_blocks = Some(stored.n_blocks);
    Ok(())
}

/// Decode the destination's copy (if any) and then the source's pages into
/// the plain file `tmp`.
fn materialize(
    ctx: &MergeContext<'_>,
    entry: &FileEntry,
    to_path: &Path,
    source: Option<&Path>,
    truncate_blocks: Option<u32>,
    tmp: &Path,
) -> Result<()> {
    if let Some(old) = ctx.to_files.find(&entry.path, entry.extra_dir_num) {
        debug!("Merge target and source files into the temporary path \"{}\"", tmp.display());
        restore_data_file(
            tmp,
            Some(to_path),
            &RestoreOptions {
                compress_alg: old.compress_alg,
                truncate_blocks: None,
                write_header: false,
                version: ctx.to.program_version(),
            },
        )?;
    } else {
        debug!("Restore source file into the temporary path \"{}\"", tmp.display());
    }

    restore_data_file(
        tmp,
        source,
        &RestoreOptions {
            compress_alg: entry.compress_alg,
            truncate_blocks,
            write_header: false,
            version: ctx.from.program_version(),
        },
    )
}
