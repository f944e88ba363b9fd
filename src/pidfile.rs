use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Exclusive lock on the PID file, guaranteeing a single running instance.
///
/// The lock is held for the lifetime of the guard; dropping it releases
/// the lock and removes the file, so a new instance can start immediately
/// after this process exits on any path.
#[derive(Debug)]
pub struct PidLock {
    /// Held only for the flock; released when the descriptor closes.
    _file: std::fs::File,
    path: PathBuf,
}

impl PidLock {
    /// Acquire the lock, writing our PID into the file.
    ///
    /// Fails without blocking when another instance already holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("opening PID file {}", path.display()))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            bail!(
                "cannot lock PID file {} (another instance running?): {err}",
                path.display()
            );
        }

        file.set_len(0)
            .with_context(|| format!("truncating PID file {}", path.display()))?;

        let mut writer = &file;
        writeln!(writer, "{}", std::process::id())
            .with_context(|| format!("writing PID file {}", path.display()))?;

        debug!(path = %path.display(), pid = std::process::id(), "acquired PID lock");

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the locked file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // The flock is released when the descriptor closes right after.
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "removing PID file failed");
        }
    }
}
