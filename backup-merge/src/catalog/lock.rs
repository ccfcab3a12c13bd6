//! Cross-process catalog lock backed by a pid file.

use crate::utils::{MergeError, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held for the duration of a merge; removes the pid file when dropped.
#[derive(Debug)]
pub struct CatalogLock {
    path: PathBuf,
}

impl CatalogLock {
    /// Take the lock at `path`, replacing a stale pid file left by a dead process.
    pub fn acquire(path: &Path) -> Result<Self> {
        let own_pid = std::process::id();

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{own_pid}")?;
                    file.sync_all()?;
                    debug!("Acquired catalog lock \"{}\"", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let owner = fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<i32>().ok());
                    match owner {
                        Some(pid) if pid as u32 != own_pid && process_alive(pid) => {
                            return Err(MergeError::LockHeld(format!(
                                "lock file \"{}\" is held by process {}",
                                path.display(),
                                pid
                            )));
                        }
                        _ => {
                            warn!("Removing stale catalog lock \"{}\"", path.display());
                            match fs::remove_file(path) {
                                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                                _ => {}
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(MergeError::LockHeld(format!(
            "could not create lock file \"{}\"",
            path.display()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove lock file \"{}\": {}", self.path.display(), e);
        }
    }
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // EPERM: the process exists but belongs to another user
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}
