//! Single-instance PID file for the daemon (§4.9, §6 persisted state layout).
//!
//! Grounded on `aiobscura`'s `process_lock.rs`: an advisory OS file lock
//! (`flock`) held for the process lifetime, released and cleaned up on
//! `Drop`. Simplified from the teacher's two-lock UI/sync negotiation (which
//! coordinated two cooperating binaries sharing one database) to a single
//! exclusive lock, since pi-brain has exactly one daemon process.

use pibrain_core::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// Holds the daemon's PID file open and locked for the process lifetime.
/// Dropping it unlocks and removes the file.
pub struct PidLock {
    file: File,
    path: PathBuf,
}

impl PidLock {
    /// Acquires the exclusive lock at `path`, writing the current process id
    /// into it. Fails fast (rather than blocking) if another live daemon
    /// already holds it, so a second `pibraind` launch errors immediately
    /// instead of silently double-running against the same database.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;

        lock_file_nonblocking(&file).map_err(|e| {
            if is_lock_busy(&e) {
                Error::Config(format!(
                    "pi-brain is already running (pid file locked: {})",
                    path.display()
                ))
            } else {
                Error::Io(e)
            }
        })?;

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(PidLock { file, path: path.to_path_buf() })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock) || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
unsafe extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("pibraind's PID lock currently requires Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_and_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pi-brain.pid");

        let lock = PidLock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        let second = PidLock::acquire(&path);
        assert!(second.is_err());

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn acquire_succeeds_again_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pi-brain.pid");

        let lock = PidLock::acquire(&path).unwrap();
        drop(lock);

        assert!(PidLock::acquire(&path).is_ok());
    }
}
