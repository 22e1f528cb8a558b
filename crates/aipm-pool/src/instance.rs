//! Single-instance guard.
//!
//! `serve` holds a pid lock file for its lifetime so two pools never drive
//! the same assistant configuration side by side.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{debug, warn};

/// Pid lock file, removed again on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock at `path`.
    ///
    /// Fails when the file names a live process other than this one. A lock
    /// left behind by a dead process is replaced.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }

        // Second attempt only after a stale file was removed.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("writing lock file {}", path.display()))?;
                    debug!("Acquired instance lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    match read_pid(&path) {
                        Some(pid) if pid != std::process::id() && process_alive(pid) => {
                            bail!(
                                "another instance (pid {pid}) holds {}",
                                path.display()
                            );
                        }
                        holder => {
                            warn!(
                                "Replacing stale instance lock {} (pid {:?})",
                                path.display(),
                                holder
                            );
                            fs::remove_file(&path).with_context(|| {
                                format!("removing stale lock file {}", path.display())
                            })?;
                        }
                    }
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("creating lock file {}", path.display()));
                }
            }
        }
        bail!("could not acquire instance lock {}", path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove lock file {}: {}", self.path.display(), err);
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM still means someone owns it.
    // SAFETY: kill(2) with signal 0 delivers nothing and touches no memory.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_pid_and_drop_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("aipm-pool.pid");

        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        assert_eq!(lock.path(), path.as_path());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aipm-pool.pid");
        // Garbage and dead pids are both stale.
        fs::write(&path, "not a pid\n").unwrap();
        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
        drop(lock);

        fs::write(&path, format!("{}\n", i32::MAX)).unwrap();
        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(read_pid(&path), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_live_holder_blocks_acquire() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("aipm-pool.pid");

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        fs::write(&path, format!("{}\n", child.id())).unwrap();

        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("another instance"));
        assert!(path.exists());

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
