//! Manifest types for merge planning.
//!
//! A manifest records every file, directory and symlink stored in a backup
//! with the metadata needed to restore or merge it. It is serialized as
//! `backup_content.json` in each backup directory.

use super::backup::CompressAlg;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Current on-disk manifest format version
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// Metadata for a single entry in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Path relative to the data root (or to the auxiliary directory), `/`-separated
    pub path: String,
    pub kind: FileKind,
    /// Size of the file in the source cluster
    #[serde(default)]
    pub size: u64,
    /// Bytes actually stored; `None` when unchanged since the parent backup
    pub write_size: Option<u64>,
    /// Block count for incremental data files; `None` otherwise
    #[serde(default)]
    pub n_blocks: Option<u32>,
    #[serde(default)]
    pub crc: u32,
    #[serde(default)]
    pub compress_alg: CompressAlg,
    #[serde(default)]
    pub is_datafile: bool,
    /// Compound (multi-segment) container file
    #[serde(default)]
    pub is_cfs: bool,
    /// 0 for the primary data root, else 1-based auxiliary directory number
    #[serde(default)]
    pub extra_dir_num: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
}

impl FileEntry {
    pub fn regular(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileKind::Regular,
            size: 0,
            write_size: None,
            n_blocks: None,
            crc: 0,
            compress_alg: CompressAlg::None,
            is_datafile: false,
            is_cfs: false,
            extra_dir_num: 0,
            link_target: None,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            kind: FileKind::Directory,
            ..Self::regular(path)
        }
    }

    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: FileKind::Symlink,
            link_target: Some(target.into()),
            ..Self::regular(path)
        }
    }

    /// Last path component
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    /// Neither bytes nor block map were stored: the parent's copy is current.
    pub fn is_unchanged(&self) -> bool {
        self.write_size.is_none() && self.n_blocks.is_none()
    }

    fn path_key(&self) -> (&str, usize) {
        (self.path.as_str(), self.extra_dir_num)
    }
}

/// Which ordering the entries are currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOrder {
    Unsorted,
    /// Descending by (path, auxiliary directory); required for lookups and
    /// for leaf-first deletion
    PathDesc,
    /// Ascending by source size, for load balancing
    Size,
}

/// Serialized form of a manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub version: u32,
    pub backup_id: String,
    pub files: Vec<FileEntry>,
}

/// In-memory manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: Vec<FileEntry>,
    order: ManifestOrder,
}

impl Manifest {
    pub fn new(entries: Vec<FileEntry>) -> Self {
        Self {
            entries,
            order: ManifestOrder::Unsorted,
        }
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut FileEntry> {
        self.entries.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn order(&self) -> ManifestOrder {
        self.order
    }

    pub fn sort_by_path_desc(&mut self) {
        self.entries.sort_by(|a, b| b.path_key().cmp(&a.path_key()));
        self.order = ManifestOrder::PathDesc;
    }

    pub fn sort_by_size(&mut self) {
        self.entries
            .sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.path_key().cmp(&b.path_key())));
        self.order = ManifestOrder::Size;
    }

    /// Binary search by relative path and auxiliary directory number.
    ///
    /// The manifest must be in [`ManifestOrder::PathDesc`].
    pub fn find(&self, path: &str, extra_dir_num: usize) -> Option<&FileEntry> {
        debug_assert_eq!(self.order, ManifestOrder::PathDesc);
        self.entries
            .binary_search_by(|e| match e.path_key().cmp(&(path, extra_dir_num)) {
                Ordering::Less => Ordering::Greater,
                Ordering::Greater => Ordering::Less,
                Ordering::Equal => Ordering::Equal,
            })
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Keep only the entries for which `f` returns true.
    pub fn retain_mut<F>(&mut self, f: F)
    where
        F: FnMut(&mut FileEntry) -> bool,
    {
        self.entries.retain_mut(f);
    }
}

/// One claim cell per manifest entry.
///
/// A worker owns an entry from the moment its `try_claim` succeeds; no entry
/// can be claimed twice.
#[derive(Debug)]
pub struct ClaimSet {
    cells: Vec<AtomicBool>,
}

impl ClaimSet {
    pub fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn try_claim(&self, index: usize) -> bool {
        self.cells
            .get(index)
            .map(|cell| {
                cell.compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sized(path: &str, size: u64) -> FileEntry {
        FileEntry {
            size,
            ..FileEntry::regular(path)
        }
    }

    #[test]
    fn test_name_and_unchanged() {
        let mut entry = FileEntry::regular("global/pg_control");
        assert_eq!(entry.name(), "pg_control");
        assert!(entry.is_unchanged());

        entry.n_blocks = Some(3);
        assert!(!entry.is_unchanged());

        assert_eq!(FileEntry::regular("top").name(), "top");
    }

    #[test]
    fn test_find_requires_path_desc_order() {
        let mut manifest = Manifest::new(vec![
            sized("base/1/100", 10),
            sized("base/1/200", 5),
            FileEntry::directory("base"),
            FileEntry {
                extra_dir_num: 2,
                ..sized("base/1/100", 1)
            },
        ]);
        manifest.sort_by_path_desc();

        assert_eq!(manifest.order(), ManifestOrder::PathDesc);
        assert_eq!(manifest.entries()[0].path, "base/1/200");
        assert_eq!(manifest.find("base/1/100", 0).map(|e| e.size), Some(10));
        assert_eq!(manifest.find("base/1/100", 2).map(|e| e.size), Some(1));
        assert!(manifest.find("base/1/100", 1).is_none());
        assert!(manifest.find("base", 0).is_some_and(FileEntry::is_dir));
        assert!(manifest.find("nope", 0).is_none());
    }

    #[test]
    fn test_sort_by_size_is_stable_by_path() {
        let mut manifest = Manifest::new(vec![sized("b", 7), sized("a", 7), sized("c", 1)]);
        manifest.sort_by_size();

        let paths: Vec<_> = manifest.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["c", "a", "b"]);
        assert_eq!(manifest.order(), ManifestOrder::Size);
    }

    #[test]
    fn test_claim_once() {
        let claims = ClaimSet::new(2);
        assert!(claims.try_claim(0));
        assert!(!claims.try_claim(0));
        assert!(claims.try_claim(1));
        assert!(!claims.try_claim(2));
    }

    #[test]
    fn test_claims_across_threads() {
        let claims = ClaimSet::new(1000);
        let won: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| (0..claims.len()).filter(|&i| claims.try_claim(i)).count()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(won, 1000);
    }
}
