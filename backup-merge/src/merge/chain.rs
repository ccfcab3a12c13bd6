//! Resolving a requested backup to its chain and merging it end to end.

use super::pair::merge_backups;
use super::MergeOptions;
use crate::catalog::{BackupDescriptor, BackupId, BackupMode, BackupStatus, Catalog};
use crate::utils::{MergeError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Merge the chain ending at `backup_id` into its full ancestor.
///
/// On success the catalog holds one full backup with identifier
/// `backup_id` in place of the whole chain.
pub fn do_merge(
    catalog: &Catalog,
    backup_id: BackupId,
    options: &MergeOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Merge started");

    let _lock = catalog.lock()?;
    let backups = catalog.backup_list()?;

    let dest = backups
        .iter()
        .find(|b| b.id() == backup_id)
        .ok_or_else(|| MergeError::NotFound(format!("Target backup {} was not found", backup_id)))?;

    if dest.backup_mode == BackupMode::Full {
        if finish_interrupted_rename(catalog, dest)? {
            info!("Merge of backup {} completed", backup_id);
            return Ok(());
        }
        return Err(MergeError::InvalidState(format!("Backup {} is full backup", backup_id)));
    }
    if !matches!(
        dest.status,
        BackupStatus::Ok | BackupStatus::Merging | BackupStatus::Deleting
    ) {
        return Err(MergeError::InvalidState(format!(
            "Backup {} has status: {}",
            backup_id, dest.status
        )));
    }

    let chain = resolve_chain(&backups, dest)?;
    let (full, incrementals) = chain.split_first().ok_or_else(|| {
        MergeError::NotFound(format!(
            "Parent full backup for the given backup {} was not found",
            backup_id
        ))
    })?;

    let mut full = full.clone();
    for from in incrementals {
        if cancel.is_cancelled() {
            return Err(MergeError::Interrupted);
        }
        let mut from = from.clone();
        merge_backups(catalog, &mut full, &mut from, options, cancel)?;
    }

    catalog.validate(&mut full)?;
    if full.status == BackupStatus::Corrupt {
        return Err(MergeError::MergeIncomplete(backup_id.to_string()));
    }

    info!("Merge of backup {} completed", backup_id);
    Ok(())
}

/// Follow parent links from `dest` up to the nearest full backup.
///
/// Returns the chain oldest first: the full backup, then every incremental
/// down to and including `dest`.
fn resolve_chain(backups: &[BackupDescriptor], dest: &BackupDescriptor) -> Result<Vec<BackupDescriptor>> {
    let mut chain = vec![dest.clone()];
    let mut current = dest;

    loop {
        let parent_id = current.parent_backup.ok_or_else(|| {
            MergeError::NotFound(format!("Failed to find parent backup for {}", current.id()))
        })?;
        let parent = backups.iter().find(|b| b.id() == parent_id).ok_or_else(|| {
            MergeError::NotFound(format!(
                "Parent backup {} of backup {} was not found",
                parent_id,
                current.id()
            ))
        })?;

        if !matches!(parent.status, BackupStatus::Ok | BackupStatus::Merging) {
            return Err(MergeError::InvalidState(format!(
                "Backup {} has status: {}",
                parent.id(),
                parent.status
            )));
        }

        chain.push(parent.clone());
        if parent.backup_mode == BackupMode::Full {
            break;
        }
        current = parent;
    }

    chain.reverse();
    Ok(chain)
}

/// A crash between the final directory rename and the final descriptor
/// write leaves a full backup whose descriptor still carries its old
/// identifier. Persist the directory's identity and report the merge done.
fn finish_interrupted_rename(catalog: &Catalog, dest: &BackupDescriptor) -> Result<bool> {
    let on_disk = catalog.read_descriptor(dest.id())?;
    if on_disk.start_time == dest.start_time || dest.status != BackupStatus::Ok {
        return Ok(false);
    }

    warn!(
        "Backup {} was renamed from {} by an interrupted merge, updating its descriptor",
        dest.id(),
        on_disk.start_time
    );
    catalog.write_descriptor(dest)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CompressAlg, Lsn};

    fn descriptor(id: u64, mode: BackupMode, parent: Option<u64>, status: BackupStatus) -> BackupDescriptor {
        BackupDescriptor {
            start_time: BackupId(id),
            backup_mode: mode,
            status,
            parent_backup: parent.map(BackupId),
            start_lsn: Lsn(0),
            stop_lsn: Lsn(0),
            recovery_time: None,
            recovery_xid: 0,
            stream: true,
            compress_alg: CompressAlg::None,
            compress_level: 1,
            data_bytes: None,
            wal_bytes: None,
            extra_dirs: None,
            program_version: "2.1.0".to_string(),
        }
    }

    #[test]
    fn test_resolve_chain_skips_siblings() -> Result<()> {
        // 400 and 300 are siblings on top of 200
        let backups = vec![
            descriptor(400, BackupMode::Page, Some(200), BackupStatus::Ok),
            descriptor(300, BackupMode::Delta, Some(200), BackupStatus::Ok),
            descriptor(200, BackupMode::Page, Some(100), BackupStatus::Merging),
            descriptor(100, BackupMode::Full, None, BackupStatus::Ok),
        ];

        let chain = resolve_chain(&backups, &backups[0])?;
        let ids: Vec<_> = chain.iter().map(|b| b.id().0).collect();
        assert_eq!(ids, vec![100, 200, 400]);
        Ok(())
    }

    #[test]
    fn test_resolve_chain_errors() {
        let orphan = vec![descriptor(300, BackupMode::Page, Some(200), BackupStatus::Ok)];
        assert!(matches!(
            resolve_chain(&orphan, &orphan[0]),
            Err(MergeError::NotFound(_))
        ));

        let broken = vec![
            descriptor(300, BackupMode::Page, Some(200), BackupStatus::Ok),
            descriptor(200, BackupMode::Page, Some(100), BackupStatus::Error),
            descriptor(100, BackupMode::Full, None, BackupStatus::Ok),
        ];
        assert!(matches!(
            resolve_chain(&broken, &broken[0]),
            Err(MergeError::InvalidState(_))
        ));

        let no_full = vec![
            descriptor(300, BackupMode::Page, Some(200), BackupStatus::Ok),
            descriptor(200, BackupMode::Delta, None, BackupStatus::Ok),
        ];
        assert!(matches!(
            resolve_chain(&no_full, &no_full[0]),
            Err(MergeError::NotFound(_))
        ));
    }
}
