//! Single-instance enforcement.
//!
//! The daemon takes an exclusive lock on a pid file at startup. A second
//! concurrent launch fails the lock and exits cleanly without mutating any
//! state. The lock lives as long as the returned guard.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use nimbus_common::{NimbusError, Result};

use crate::cache::default_cache_dir;

/// File name of the pid file inside the cache directory.
const PID_FILE: &str = "nimbus-server.pid";

/// Guard holding the exclusive daemon lock.
///
/// # Example
///
/// ```no_run
/// use nimbus_server::PidLock;
///
/// let _lock = PidLock::acquire_default()?;
/// // run the daemon; the lock is released on drop
/// # Ok::<(), nimbus_common::NimbusError>(())
/// ```
pub struct PidLock {
    file: std::fs::File,
    path: PathBuf,
}

impl PidLock {
    /// Acquires the lock at the fixed per-user path
    /// (`~/.cache/nimbus/nimbus-server.pid`).
    pub fn acquire_default() -> Result<Self> {
        Self::acquire(default_cache_dir().join(PID_FILE))
    }

    /// Acquires the lock at `path`, writing this process's pid into it.
    ///
    /// # Errors
    ///
    /// Returns [`NimbusError::AlreadyRunning`] when another process holds
    /// the lock.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if fs2::FileExt::try_lock_exclusive(&file).is_err() {
            return Err(NimbusError::AlreadyRunning(format!(
                "pid file {} is locked by another process",
                path.display()
            )));
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { file, path })
    }

    /// The pid file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("failed to release pid lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to remove pid file: {}", e);
        }
    }
}
