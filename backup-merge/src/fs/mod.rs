//! File system helpers shared by the catalog, codec and merge engine.

pub mod temp;
pub mod walker;

pub use temp::ScopedTempFile;

use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Permission mode for directories created inside a backup
pub const DIR_PERMISSION: u32 = 0o700;

/// Create `path` and any missing parents with [`DIR_PERMISSION`].
pub fn create_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_PERMISSION);
    }
    builder.create(path)
}

/// Delete a file, symlink or empty directory. A missing path is not an error.
pub fn remove_entry(path: &Path) -> io::Result<()> {
    let result = match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Recursively delete a directory and its contents, leaf-first.
pub fn remove_dir_with_files(path: &Path) -> io::Result<()> {
    for entry in walker::list_tree(path, true)? {
        remove_entry(&entry.path)?;
        debug!("Deleted \"{}\"", entry.path.display());
    }
    remove_entry(path)
}
