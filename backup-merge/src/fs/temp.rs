//! Scoped temporary sibling files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// A uniquely named file next to `target` that is removed when dropped.
///
/// The file itself is not created; callers write to [`ScopedTempFile::path`].
/// Use [`ScopedTempFile::remove`] to observe removal errors, or
/// [`ScopedTempFile::persist`] to rename the content over the target.
#[derive(Debug)]
pub struct ScopedTempFile {
    path: PathBuf,
    armed: bool,
}

impl ScopedTempFile {
    pub fn sibling(target: &Path) -> Self {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = target.with_file_name(format!("{}_tmp.{}", name, Uuid::new_v4().simple()));
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now. A file that was never written is not an error.
    pub fn remove(mut self) -> io::Result<()> {
        self.armed = false;
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Atomically rename the file over `target`.
    pub fn persist(mut self, target: &Path) -> io::Result<()> {
        fs::rename(&self.path, target)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for ScopedTempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove temporary file \"{}\": {}", self.path.display(), e);
            }
        }
    }
}
