//! Mutual exclusion around packet filter mutation
//!
//! The kernel tables are one global resource with no transactions, so
//! the watchdog, operator commands and the portal all take the same
//! advisory `flock` before touching them. The lock is released when the
//! guard drops (or the process dies).

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Failed to open lock file {path}: {source}")]
    OpenError { path: PathBuf, source: io::Error },
    #[error("Lock {path} still held by another process after {}s", waited.as_secs())]
    Busy { path: PathBuf, waited: Duration },
    #[error("flock failed: {0}")]
    SystemError(String),
}

#[derive(Debug, Clone)]
pub struct MutationLock {
    path: PathBuf,
}

/// Held lock; dropping it releases the flock
pub struct LockGuard {
    #[cfg(unix)]
    _file: Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

impl MutationLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait up to `timeout` for the lock
    pub async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire()? {
                debug!("Acquired mutation lock {}", self.path.display());
                return Ok(guard);
            }
            if started.elapsed() >= timeout {
                return Err(LockError::Busy {
                    path: self.path.clone(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// One non-blocking attempt; `Ok(None)` when another holder exists
    pub fn try_acquire(&self) -> Result<Option<LockGuard>, LockError> {
        let open_error = |source| LockError::OpenError {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(open_error)?;
        }
        // Never truncate before holding the lock
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(open_error)?;

        #[cfg(unix)]
        {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(mut locked) => {
                    stamp_owner(&mut locked);
                    Ok(Some(LockGuard { _file: locked }))
                }
                Err((_, Errno::EWOULDBLOCK)) => Ok(None),
                Err((_, errno)) => Err(LockError::SystemError(errno.to_string())),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = file;
            Err(LockError::SystemError(
                "flock not supported on this platform".to_string(),
            ))
        }
    }
}

/// Record the holder's pid for whoever inspects a stuck lock
fn stamp_owner(file: &mut File) {
    if let Err(e) = write_pid(file) {
        debug!("Could not stamp lock owner: {}", e);
    }
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    let pos = file.stream_position()?;
    file.set_len(pos)
}
