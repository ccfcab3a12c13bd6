//! Whole-file transfers: plain copies, control-file transplant and checksums.

use crate::catalog::manifest::{FileEntry, FileKind};
use crate::fs::{create_dir, ScopedTempFile};
use crate::utils::{MergeError, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Name of the cluster control file, which is never block-diffed
pub const CONTROL_FILE_NAME: &str = "pg_control";

/// Fixed size of the control file
pub const CONTROL_FILE_SIZE: usize = 8192;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// CRC-32 of a file's content
pub fn file_crc(path: &Path) -> io::Result<u32> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

pub fn file_size(path: &Path) -> io::Result<u64> {
    Ok(fs::metadata(path)?.len())
}

/// Copy `entry` from `from_root` to `to_root`, returning `(write_size, crc)`.
///
/// Symlinks are re-created with their recorded target; their write size is 0.
pub fn copy_file(from_root: &Path, to_root: &Path, entry: &FileEntry) -> Result<(u64, u32)> {
    let source = from_root.join(&entry.path);
    let target = to_root.join(&entry.path);
    if let Some(parent) = target.parent() {
        create_dir(parent)?;
    }

    if entry.kind == FileKind::Symlink {
        let link = entry.link_target.as_deref().ok_or_else(|| {
            MergeError::Codec(format!("symlink \"{}\" has no target", entry.path))
        })?;
        crate::fs::remove_entry(&target)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(link, &target)?;
        #[cfg(not(unix))]
        fs::copy(&source, &target)?;
        return Ok((0, 0));
    }

    let mut reader = BufReader::new(File::open(&source)?);
    let mut writer = BufWriter::new(File::create(&target)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        hasher.update(&buf[..n]);
        written += n as u64;
    }
    writer.flush()?;

    Ok((written, hasher.finalize()))
}

/// Transplant the control file verbatim, returning `(write_size, crc)`.
///
/// The file has a fixed size; anything else means the source is damaged.
/// The new copy is written next to the target and renamed into place.
pub fn copy_control_file(from_root: &Path, to_root: &Path, entry: &FileEntry) -> Result<(u64, u32)> {
    let source = from_root.join(&entry.path);
    let target = to_root.join(&entry.path);

    let content = fs::read(&source)?;
    if content.len() != CONTROL_FILE_SIZE {
        return Err(MergeError::Codec(format!(
            "unexpected control file size {} in \"{}\", expected {}",
            content.len(),
            source.display(),
            CONTROL_FILE_SIZE
        )));
    }

    if let Some(parent) = target.parent() {
        create_dir(parent)?;
    }
    let tmp = ScopedTempFile::sibling(&target);
    {
        let mut file = File::create(tmp.path())?;
        file.write_all(&content)?;
        file.sync_all()?;
    }
    tmp.persist(&target)?;

    Ok((content.len() as u64, crc32fast::hash(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_copy_file_reports_size_and_crc() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let from = temp_dir.path().join("from");
        let to = temp_dir.path().join("to");
        fs::create_dir_all(from.join("pg_hba.d"))?;
        fs::write(from.join("pg_hba.d/local.conf"), b"local all all trust")?;

        let entry = FileEntry::regular("pg_hba.d/local.conf");
        let (size, crc) = copy_file(&from, &to, &entry)?;

        assert_eq!(size, 19);
        assert_eq!(crc, crc32fast::hash(b"local all all trust"));
        assert_eq!(fs::read(to.join("pg_hba.d/local.conf"))?, b"local all all trust");
        assert_eq!(file_crc(&to.join("pg_hba.d/local.conf"))?, crc);
        assert_eq!(file_size(&to.join("pg_hba.d/local.conf"))?, 19);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_copy_symlink_recreates_link() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let from = temp_dir.path().join("from");
        let to = temp_dir.path().join("to");
        fs::create_dir_all(&to)?;
        fs::write(to.join("pg_wal"), b"stale")?;

        let entry = FileEntry::symlink("pg_wal", "/mnt/wal");
        assert_eq!(copy_file(&from, &to, &entry)?, (0, 0));
        assert_eq!(fs::read_link(to.join("pg_wal"))?, Path::new("/mnt/wal"));
        Ok(())
    }

    #[test]
    fn test_control_file_transplant() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let from = temp_dir.path().join("from");
        let to = temp_dir.path().join("to");
        fs::create_dir_all(from.join("global"))?;
        let content = vec![3u8; CONTROL_FILE_SIZE];
        fs::write(from.join("global/pg_control"), &content)?;

        let entry = FileEntry::regular("global/pg_control");
        let (size, crc) = copy_control_file(&from, &to, &entry)?;

        assert_eq!(size, CONTROL_FILE_SIZE as u64);
        assert_eq!(crc, crc32fast::hash(&content));
        assert_eq!(fs::read(to.join("global/pg_control"))?, content);
        // Only the control file is left behind, no temporary sibling
        assert_eq!(fs::read_dir(to.join("global"))?.count(), 1);
        Ok(())
    }

    #[test]
    fn test_control_file_wrong_size() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let from = temp_dir.path().join("from");
        fs::create_dir_all(from.join("global"))?;
        fs::write(from.join("global/pg_control"), b"short")?;

        let entry = FileEntry::regular("global/pg_control");
        let result = copy_control_file(&from, &temp_dir.path().join("to"), &entry);
        assert!(matches!(result, Err(MergeError::Codec(_))));
        Ok(())
    }
}
