//! Backup catalog: on-disk layout, descriptors, manifests and validation.
//!
//! ```text
//! <root>/backups/<instance>/backup.pid
//! <root>/backups/<instance>/<ID>/backup.json
//! <root>/backups/<instance>/<ID>/backup_content.json
//! <root>/backups/<instance>/<ID>/extra_dirs_reorder.json   (only mid-merge)
//! <root>/backups/<instance>/<ID>/database/...
//! <root>/backups/<instance>/<ID>/external_directories/externaldirN/...
//! ```

pub mod backup;
pub mod lock;
pub mod manifest;

pub use backup::{BackupDescriptor, BackupId, BackupMode, BackupStatus, CompressAlg, ExtraDirs, Lsn};
pub use lock::CatalogLock;
pub use manifest::{ClaimSet, FileEntry, FileKind, Manifest, ManifestFile, MANIFEST_VERSION};

use crate::codec::file_crc;
use crate::fs::{remove_entry, walker, ScopedTempFile};
use crate::utils::{MergeError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DESCRIPTOR_FILE: &str = "backup.json";
pub const MANIFEST_FILE: &str = "backup_content.json";
pub const DATABASE_DIR: &str = "database";
pub const EXTRA_DIR: &str = "external_directories";
pub const LOCK_FILE: &str = "backup.pid";
pub const REORDER_FILE: &str = "extra_dirs_reorder.json";

/// Container directory of auxiliary directory `num` under `prefix`.
pub fn extra_dir_path(prefix: &Path, num: usize) -> PathBuf {
    prefix.join(format!("externaldir{num}"))
}

/// Catalog of one instance's backups.
#[derive(Debug, Clone)]
pub struct Catalog {
    instance_dir: PathBuf,
}

impl Catalog {
    pub fn new(root: &Path, instance: &str) -> Self {
        Self {
            instance_dir: root.join("backups").join(instance),
        }
    }

    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    pub fn backup_path(&self, id: BackupId) -> PathBuf {
        self.instance_dir.join(id.to_string())
    }

    pub fn database_path(&self, id: BackupId) -> PathBuf {
        self.backup_path(id).join(DATABASE_DIR)
    }

    pub fn extra_prefix(&self, id: BackupId) -> PathBuf {
        self.backup_path(id).join(EXTRA_DIR)
    }

    /// Where `entry` of backup `id` is stored on disk.
    pub fn entry_path(&self, id: BackupId, entry: &FileEntry) -> PathBuf {
        if entry.extra_dir_num == 0 {
            self.database_path(id).join(&entry.path)
        } else {
            extra_dir_path(&self.extra_prefix(id), entry.extra_dir_num).join(&entry.path)
        }
    }

    /// Take the cross-process catalog lock.
    pub fn lock(&self) -> Result<CatalogLock> {
        crate::fs::create_dir(&self.instance_dir)?;
        CatalogLock::acquire(&self.instance_dir.join(LOCK_FILE))
    }

    /// All backups of the instance, newest first.
    pub fn backup_list(&self) -> Result<Vec<BackupDescriptor>> {
        let mut backups = Vec::new();
        let dir = match fs::read_dir(&self.instance_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(backups),
            Err(e) => return Err(e.into()),
        };

        for entry in dir {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(dir_id) = name.parse::<BackupId>() else {
                continue;
            };

            let path = entry.path().join(DESCRIPTOR_FILE);
            let mut descriptor: BackupDescriptor = match read_json(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Skip backup directory \"{}\": {}", entry.path().display(), e);
                    continue;
                }
            };

            // The directory name is authoritative: the rename that completes a
            // merge happens before the descriptor learns its new identity.
            if descriptor.start_time != dir_id {
                warn!(
                    "Backup {} is stored in directory {}, using the directory name",
                    descriptor.start_time, dir_id
                );
                descriptor.start_time = dir_id;
            }
            backups.push(descriptor);
        }

        backups.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(backups)
    }

    pub fn read_descriptor(&self, id: BackupId) -> Result<BackupDescriptor> {
        read_json(&self.backup_path(id).join(DESCRIPTOR_FILE))
    }

    pub fn write_descriptor(&self, backup: &BackupDescriptor) -> Result<()> {
        write_json(&self.backup_path(backup.id()).join(DESCRIPTOR_FILE), backup)
    }

    pub fn read_manifest(&self, backup: &BackupDescriptor) -> Result<Manifest> {
        let file: ManifestFile = read_json(&self.backup_path(backup.id()).join(MANIFEST_FILE))?;
        if file.version > MANIFEST_VERSION {
            return Err(MergeError::InvalidState(format!(
                "manifest of backup {} has unsupported version {}",
                backup.id(),
                file.version
            )));
        }
        Ok(Manifest::new(file.files))
    }

    pub fn write_manifest(&self, backup: &BackupDescriptor, manifest: &Manifest) -> Result<()> {
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            backup_id: backup.id().to_string(),
            files: manifest.entries().to_vec(),
        };
        write_json(&self.backup_path(backup.id()).join(MANIFEST_FILE), &file)
    }

    /// The auxiliary-directory reorder recorded for backup `id`, if one is
    /// in progress.
    pub fn read_reorder_intent<T: DeserializeOwned>(&self, id: BackupId) -> Result<Option<T>> {
        match fs::read(self.backup_path(id).join(REORDER_FILE)) {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_reorder_intent<T: Serialize>(&self, id: BackupId, intent: &T) -> Result<()> {
        write_json(&self.backup_path(id).join(REORDER_FILE), intent)
    }

    pub fn remove_reorder_intent(&self, id: BackupId) -> Result<()> {
        remove_entry(&self.backup_path(id).join(REORDER_FILE))?;
        Ok(())
    }

    /// Check every stored file against its manifest checksum.
    ///
    /// A damaged backup is marked CORRUPT and persisted; a valid one is left
    /// exactly as it was.
    pub fn validate(&self, backup: &mut BackupDescriptor) -> Result<()> {
        info!("Validating backup {}", backup.id());

        let manifest = match self.read_manifest(backup) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Cannot read file list of backup {}: {}", backup.id(), e);
                return self.mark_corrupt(backup);
            }
        };

        let mut corrupted = false;
        for entry in manifest.entries() {
            let Some(write_size) = entry.write_size else {
                continue;
            };
            if !entry.is_regular() {
                continue;
            }

            let path = self.entry_path(backup.id(), entry);
            match (crate::codec::file_size(&path), file_crc(&path)) {
                (Ok(size), Ok(crc)) if size == write_size && crc == entry.crc => {}
                (Ok(size), Ok(crc)) => {
                    warn!(
                        "Invalid file \"{}\": size {} crc {:08X}, expected size {} crc {:08X}",
                        path.display(),
                        size,
                        crc,
                        write_size,
                        entry.crc
                    );
                    corrupted = true;
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Cannot read backup file \"{}\": {}", path.display(), e);
                    corrupted = true;
                }
            }
        }

        if corrupted {
            return self.mark_corrupt(backup);
        }

        info!("Backup {} data files are valid", backup.id());
        Ok(())
    }

    fn mark_corrupt(&self, backup: &mut BackupDescriptor) -> Result<()> {
        warn!("Backup {} data files are corrupted", backup.id());
        backup.status = BackupStatus::Corrupt;
        self.write_descriptor(backup)
    }

    /// Remove every artifact of a backup.
    ///
    /// The backup is marked DELETING first. Content goes leaf-first, then the
    /// manifest, then the descriptor, then the directory itself.
    pub fn delete_backup_files(&self, backup: &mut BackupDescriptor) -> Result<()> {
        let path = self.backup_path(backup.id());
        info!("Delete: {}", backup.id());

        backup.status = BackupStatus::Deleting;
        self.write_descriptor(backup)?;

        let descriptor = path.join(DESCRIPTOR_FILE);
        let manifest = path.join(MANIFEST_FILE);
        for entry in walker::list_tree(&path, true)? {
            if entry.path == descriptor || entry.path == manifest {
                continue;
            }
            remove_entry(&entry.path)?;
            debug!("Deleted \"{}\"", entry.path.display());
        }

        remove_entry(&manifest)?;
        remove_entry(&descriptor)?;
        remove_entry(&path)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

/// Write `value` next to `path` and rename it into place.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    let tmp = ScopedTempFile::sibling(path);
    {
        let mut file = fs::File::create(tmp.path())?;
        file.write_all(&content)?;
        file.sync_all()?;
    }
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(id: u64, mode: BackupMode, parent: Option<u64>) -> BackupDescriptor {
        BackupDescriptor {
            start_time: BackupId(id),
            backup_mode: mode,
            status: BackupStatus::Ok,
            parent_backup: parent.map(BackupId),
            start_lsn: Lsn(id * 100),
            stop_lsn: Lsn(id * 100 + 50),
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

    fn store_file(catalog: &Catalog, backup: &BackupDescriptor, path: &str, content: &[u8]) -> Result<FileEntry> {
        let mut entry = FileEntry::regular(path);
        let on_disk = catalog.entry_path(backup.id(), &entry);
        crate::fs::create_dir(on_disk.parent().unwrap())?;
        fs::write(&on_disk, content)?;
        entry.size = content.len() as u64;
        entry.write_size = Some(content.len() as u64);
        entry.crc = crc32fast::hash(content);
        Ok(entry)
    }

    #[test]
    fn test_backup_list_newest_first() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = Catalog::new(temp_dir.path(), "main");

        for d in [
            descriptor(100, BackupMode::Full, None),
            descriptor(300, BackupMode::Delta, Some(200)),
            descriptor(200, BackupMode::Page, Some(100)),
        ] {
            crate::fs::create_dir(&catalog.backup_path(d.id()))?;
            catalog.write_descriptor(&d)?;
        }
        // Not a backup
        fs::create_dir_all(catalog.instance_dir().join("not-a-backup!"))?;
        crate::fs::create_dir(&catalog.backup_path(BackupId(400)))?;

        let ids: Vec<_> = catalog.backup_list()?.iter().map(|b| b.id().0).collect();
        assert_eq!(ids, vec![300, 200, 100]);
        Ok(())
    }

    #[test]
    fn test_directory_name_wins() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = Catalog::new(temp_dir.path(), "main");

        let d = descriptor(100, BackupMode::Full, None);
        crate::fs::create_dir(&catalog.backup_path(d.id()))?;
        catalog.write_descriptor(&d)?;
        fs::rename(catalog.backup_path(BackupId(100)), catalog.backup_path(BackupId(150)))?;

        let backups = catalog.backup_list()?;
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].id(), BackupId(150));
        Ok(())
    }

    #[test]
    fn test_validate_is_idempotent_on_valid_backup() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = Catalog::new(temp_dir.path(), "main");

        let mut d = descriptor(100, BackupMode::Full, None);
        crate::fs::create_dir(&catalog.database_path(d.id()))?;
        let entry = store_file(&catalog, &d, "postgresql.conf", b"shared_buffers = 128MB")?;
        catalog.write_manifest(&d, &Manifest::new(vec![FileEntry::directory("base"), entry]))?;
        catalog.write_descriptor(&d)?;

        let descriptor_before = fs::read(catalog.backup_path(d.id()).join(DESCRIPTOR_FILE))?;
        let manifest_before = fs::read(catalog.backup_path(d.id()).join(MANIFEST_FILE))?;

        catalog.validate(&mut d)?;
        catalog.validate(&mut d)?;

        assert_eq!(d.status, BackupStatus::Ok);
        assert_eq!(fs::read(catalog.backup_path(d.id()).join(DESCRIPTOR_FILE))?, descriptor_before);
        assert_eq!(fs::read(catalog.backup_path(d.id()).join(MANIFEST_FILE))?, manifest_before);
        Ok(())
    }

    #[test]
    fn test_validate_marks_corrupt() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = Catalog::new(temp_dir.path(), "main");

        let mut d = descriptor(100, BackupMode::Full, None);
        let entry = store_file(&catalog, &d, "postgresql.conf", b"shared_buffers = 128MB")?;
        catalog.write_manifest(&d, &Manifest::new(vec![entry]))?;
        catalog.write_descriptor(&d)?;
        fs::write(catalog.database_path(d.id()).join("postgresql.conf"), b"tampered")?;

        catalog.validate(&mut d)?;

        assert_eq!(d.status, BackupStatus::Corrupt);
        assert_eq!(catalog.read_descriptor(d.id())?.status, BackupStatus::Corrupt);
        Ok(())
    }

    #[test]
    fn test_delete_backup_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let catalog = Catalog::new(temp_dir.path(), "main");

        let mut d = descriptor(100, BackupMode::Page, Some(50));
        let entry = store_file(&catalog, &d, "base/1/100", b"page")?;
        catalog.write_manifest(&d, &Manifest::new(vec![entry]))?;
        catalog.write_descriptor(&d)?;

        catalog.delete_backup_files(&mut d)?;

        assert_eq!(d.status, BackupStatus::Deleting);
        assert!(!catalog.backup_path(d.id()).exists());
        assert!(catalog.backup_list()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_entry_path_resolution() {
        let catalog = Catalog::new(Path::new("/catalog"), "main");
        let mut entry = FileEntry::regular("conf/app.conf");

        assert_eq!(
            catalog.entry_path(BackupId(36), &entry),
            Path::new("/catalog/backups/main/10/database/conf/app.conf")
        );

        entry.extra_dir_num = 2;
        assert_eq!(
            catalog.entry_path(BackupId(36), &entry),
            Path::new("/catalog/backups/main/10/external_directories/externaldir2/conf/app.conf")
        );
        // The stored relative path is untouched
        assert_eq!(entry.path, "conf/app.conf");
    }
}
