//! Backup descriptor and the small value types it is built from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Backup identifier: the backup's start time in Unix seconds.
///
/// Displayed (and stored on disk) in upper-case base 36.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(pub u64);

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let mut value = self.0;
        let mut buf = Vec::with_capacity(13);
        loop {
            buf.push(DIGITS[(value % 36) as usize]);
            value /= 36;
            if value == 0 {
                break;
            }
        }
        buf.reverse();
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

impl FromStr for BackupId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 36)
            .map(BackupId)
            .map_err(|e| format!("invalid backup id \"{s}\": {e}"))
    }
}

/// Position in the write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupMode {
    Full,
    Page,
    Delta,
}

impl BackupMode {
    pub fn is_incremental(self) -> bool {
        !matches!(self, BackupMode::Full)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupStatus {
    Ok,
    Error,
    Running,
    Merging,
    Deleting,
    Deleted,
    Done,
    Orphan,
    Corrupt,
}

impl BackupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Ok => "OK",
            BackupStatus::Error => "ERROR",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Merging => "MERGING",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Done => "DONE",
            BackupStatus::Orphan => "ORPHAN",
            BackupStatus::Corrupt => "CORRUPT",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressAlg {
    #[default]
    None,
    Zstd,
}

impl CompressAlg {
    pub fn is_compressed(self) -> bool {
        !matches!(self, CompressAlg::None)
    }
}

/// Program version that produced a backup, as a comparable number
/// (`"2.0.25"` becomes `20025`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProgramVersion(pub u32);

impl ProgramVersion {
    /// Backups older than this may store a compressed page whose
    /// compressed size equals the page size.
    pub const RAW_SIZED_COMPRESSED_PAGES_FIXED: ProgramVersion = ProgramVersion(20023);

    pub fn parse(tag: &str) -> Self {
        let mut parts = tag.trim().split('.').map(|p| p.parse::<u32>().unwrap_or(0));
        let major = parts.next().unwrap_or(0);
        let minor = parts.next().unwrap_or(0);
        let patch = parts.next().unwrap_or(0);
        ProgramVersion(major * 10000 + minor * 100 + patch)
    }

    pub fn may_store_raw_sized_compressed_pages(self) -> bool {
        self < Self::RAW_SIZED_COMPRESSED_PAGES_FIXED
    }
}

/// Per-backup descriptor persisted as `backup.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupDescriptor {
    pub start_time: BackupId,
    pub backup_mode: BackupMode,
    pub status: BackupStatus,
    pub parent_backup: Option<BackupId>,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub recovery_time: Option<DateTime<Utc>>,
    pub recovery_xid: u64,
    /// WAL was captured inline rather than taken from the archive
    pub stream: bool,
    pub compress_alg: CompressAlg,
    pub compress_level: i32,
    pub data_bytes: Option<u64>,
    /// `None` when not applicable (stream backups)
    pub wal_bytes: Option<u64>,
    /// `:`-separated auxiliary directory paths, in numbering order
    #[serde(default)]
    pub extra_dirs: Option<String>,
    pub program_version: String,
}

impl BackupDescriptor {
    pub fn id(&self) -> BackupId {
        self.start_time
    }

    pub fn program_version(&self) -> ProgramVersion {
        ProgramVersion::parse(&self.program_version)
    }

    pub fn extra_dir_list(&self) -> ExtraDirs {
        ExtraDirs::parse(self.extra_dirs.as_deref())
    }
}

/// Ordered list of a backup's auxiliary directories with a reverse
/// path-to-number map. Numbers are 1-based; 0 means the primary data root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtraDirs {
    paths: Vec<String>,
    numbers: HashMap<String, usize>,
}

impl ExtraDirs {
    pub fn parse(encoded: Option<&str>) -> Self {
        let paths = encoded
            .unwrap_or_default()
            .split(':')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Self::from_paths(paths)
    }

    pub fn from_paths(paths: Vec<String>) -> Self {
        let mut numbers = HashMap::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            numbers.entry(path.clone()).or_insert(i + 1);
        }
        Self { paths, numbers }
    }

    /// 1-based number of `path`, if this backup knows it.
    pub fn number_of(&self, path: &str) -> Option<usize> {
        self.numbers.get(path).copied()
    }

    /// Path registered under the 1-based `number`.
    pub fn path_of(&self, number: usize) -> Option<&str> {
        number
            .checked_sub(1)
            .and_then(|i| self.paths.get(i))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// `(number, path)` pairs in numbering order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.paths.iter().enumerate().map(|(i, p)| (i + 1, p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_id_base36() {
        let id = BackupId(1_546_300_800);
        assert_eq!(id.to_string(), "PKMLC0");
        assert_eq!("PKMLC0".parse::<BackupId>().unwrap(), id);
        assert_eq!(BackupId(0).to_string(), "0");
        assert!("not/an/id".parse::<BackupId>().is_err());
    }

    #[test]
    fn test_lsn_display() {
        assert_eq!(Lsn(0x0000_0001_0000_0028).to_string(), "1/28");
        assert_eq!(Lsn(0).to_string(), "0/0");
    }

    #[test]
    fn test_program_version() {
        assert_eq!(ProgramVersion::parse("2.0.25"), ProgramVersion(20025));
        assert!(ProgramVersion::parse("2.0.22").may_store_raw_sized_compressed_pages());
        assert!(!ProgramVersion::parse("2.0.23").may_store_raw_sized_compressed_pages());
        assert_eq!(ProgramVersion::parse("garbage"), ProgramVersion(0));
    }

    #[test]
    fn test_extra_dirs_lookup() {
        let dirs = ExtraDirs::parse(Some("/etc/app:/opt/data"));
        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs.number_of("/opt/data"), Some(2));
        assert_eq!(dirs.number_of("/missing"), None);
        assert_eq!(dirs.path_of(1), Some("/etc/app"));
        assert_eq!(dirs.path_of(0), None);
        assert_eq!(dirs.path_of(3), None);

        assert!(ExtraDirs::parse(None).is_empty());
        assert!(ExtraDirs::parse(Some("")).is_empty());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&BackupStatus::Merging).unwrap();
        assert_eq!(json, "\"MERGING\"");
        let mode: BackupMode = serde_json::from_str("\"DELTA\"").unwrap();
        assert_eq!(mode, BackupMode::Delta);
    }
}
