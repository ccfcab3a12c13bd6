//! Directory traversal for catalog maintenance.
//!
//! Lists a backup tree including directories so callers can delete it
//! leaf-first or inspect what a merge left behind.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root, `/`-separated
    pub relative_path: String,

    /// File size in bytes (0 for directories)
    pub size: u64,

    /// Is this a directory?
    pub is_dir: bool,

    /// Is this a symlink? Symlinks are never followed.
    pub is_symlink: bool,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Self> {
        let metadata = entry.path().symlink_metadata()?;
        let path = entry.path().to_path_buf();
        let relative_path = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            relative_path,
            size: if metadata.is_file() { metadata.len() } else { 0 },
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            path,
        })
    }
}

/// Walk a directory tree and collect every entry below `root`.
///
/// The root itself is not included. With `contents_first` every directory
/// is listed after its contents, which is the order a recursive delete needs.
/// A missing root yields an empty list.
pub fn list_tree(root: &Path, contents_first: bool) -> std::io::Result<Vec<FileInfo>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .contents_first(contents_first);

    for entry in walker {
        let entry = entry?;
        entries.push(FileInfo::from_entry(&entry, root)?);
    }

    Ok(entries)
}

/// Relative paths of regular files below `root`, sorted.
pub fn list_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut files: Vec<String> = list_tree(root, false)?
        .into_iter()
        .filter(|f| !f.is_dir)
        .map(|f| f.relative_path)
        .collect();
    files.sort();
    Ok(files)
}
