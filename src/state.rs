//! Persistent update state and the cross-process update lock.
//!
//! The lock file `<install>/.handover/update.lock` serves two purposes:
//!
//! - Holding an exclusive OS lock on it marks an update as in progress. Both
//!   the current process and the successor take it; the current process
//!   releases it before spawning the successor.
//! - Its content is a single lowercase word recording how far the last update
//!   got, so a restarted pipeline can resume instead of starting over.
//!
//! All reads and writes go through the locked handle, since some platforms
//! refuse access to a locked file from any other handle.

use fs4::fs_std::FileExt;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, warn};

use crate::constants::{
    LOCK_FILE_NAME, MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS, STATE_LOCK_TIMEOUT,
    WORK_DIR_NAME,
};
use crate::core::StateError;

/// Location of the lock/state file of the installation at `root`.
pub fn lock_path(root: &Path) -> PathBuf {
    root.join(WORK_DIR_NAME).join(LOCK_FILE_NAME)
}

/// How far the last update attempt progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    /// No update recorded.
    #[default]
    None,
    /// An update was initiated.
    Init,
    /// Release metadata and asset URLs are valid.
    Ready,
    /// Both assets are verified and the blob is staged.
    Downloaded,
    /// Resolution failed.
    BadUrl,
    /// The pipeline reached an inconsistent state.
    InvalidState,
}

impl UpdateState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Init => "init",
            Self::Ready => "ready",
            Self::Downloaded => "downloaded",
            Self::BadUrl => "badurl",
            Self::InvalidState => "invalidstate",
        }
    }

    /// Failure states recorded for diagnosis.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::BadUrl | Self::InvalidState)
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "init" => Ok(Self::Init),
            "ready" => Ok(Self::Ready),
            "downloaded" => Ok(Self::Downloaded),
            "badurl" => Ok(Self::BadUrl),
            "invalidstate" => Ok(Self::InvalidState),
            _ => Err(()),
        }
    }
}

fn parse(path: &Path, content: &str) -> Result<UpdateState, StateError> {
    content.parse().map_err(|()| StateError::Malformed {
        path: path.to_path_buf(),
        content: content.trim().to_string(),
    })
}

/// Reads the recorded state without taking the lock.
///
/// Used for reporting only; a missing file reads as [`UpdateState::None`].
pub fn peek_state(path: &Path) -> Result<UpdateState, StateError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse(path, &content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UpdateState::None),
        Err(source) => Err(StateError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Exclusive hold on the update lock file. Released on drop.
#[derive(Debug)]
pub struct UpdateLock {
    file: Arc<File>,
    path: PathBuf,
    locked: bool,
}

impl UpdateLock {
    /// Takes the lock on `path`, creating the file if needed.
    ///
    /// Fails with [`StateError::AlreadyLocked`] when another holder keeps it
    /// for longer than two seconds. With `force`, a held lock only logs a
    /// warning and the returned handle is unlocked.
    pub async fn acquire(path: &Path, force: bool) -> Result<Self, StateError> {
        Self::acquire_with_timeout(path, force, STATE_LOCK_TIMEOUT).await
    }

    pub async fn acquire_with_timeout(
        path: &Path,
        force: bool,
        timeout: Duration,
    ) -> Result<Self, StateError> {
        let io = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };

        let open_path = path.to_path_buf();
        let file = tokio::task::spawn_blocking(move || {
            if let Some(parent) = open_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            OpenOptions::new().create(true).truncate(false).read(true).write(true).open(&open_path)
        })
        .await
        .map_err(|e| io(std::io::Error::other(e)))?
        .map_err(io)?;
        let file = Arc::new(file);

        let start = Instant::now();
        let backoff = ExponentialBackoff::from_millis(STARTING_BACKOFF_DELAY_MS)
            .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS));

        for delay in backoff {
            let handle = Arc::clone(&file);
            let attempt = tokio::task::spawn_blocking(move || handle.try_lock_exclusive())
                .await
                .map_err(|e| io(std::io::Error::other(e)))?;

            match attempt {
                Ok(true) => {
                    debug!(wait_ms = start.elapsed().as_millis(), "Update lock acquired: {}", path.display());
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                        locked: true,
                    });
                }
                Ok(false) => {}
                Err(source) if source.kind() != std::io::ErrorKind::WouldBlock => {
                    return Err(StateError::Lock {
                        path: path.to_path_buf(),
                        source,
                    });
                }
                Err(_) => {}
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(delay.min(remaining)).await;
        }

        if force {
            warn!("Update lock {} is held by another process; continuing unlocked", path.display());
            return Ok(Self {
                file,
                path: path.to_path_buf(),
                locked: false,
            });
        }

        Err(StateError::AlreadyLocked {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False when the lock was bypassed with `force`.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn io(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Reads the recorded state.
    pub fn load(&self) -> Result<UpdateState, StateError> {
        let mut file = self.file.as_ref();
        let mut content = String::new();
        file.seek(SeekFrom::Start(0)).map_err(|e| self.io(e))?;
        file.read_to_string(&mut content).map_err(|e| self.io(e))?;
        parse(&self.path, &content)
    }

    /// Replaces the recorded state.
    pub fn store(&self, state: UpdateState) -> Result<(), StateError> {
        debug!(%state, "Recording update state");
        self.write(state.as_str())
    }

    /// Removes the record after a completed update.
    pub fn clear(&self) -> Result<(), StateError> {
        debug!("Clearing update state");
        self.write("")
    }

    fn write(&self, content: &str) -> Result<(), StateError> {
        let mut file = self.file.as_ref();
        file.set_len(0).map_err(|e| self.io(e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| self.io(e))?;
        file.write_all(content.as_bytes()).map_err(|e| self.io(e))?;
        file.sync_all().map_err(|e| self.io(e))
    }

    /// Releases the lock.
    pub fn release(self) {
        debug!("Update lock released: {}", self.path.display());
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        if self.locked {
            let _ = FileExt::unlock(self.file.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn test_state_words() {
        for state in [
            UpdateState::None,
            UpdateState::Init,
            UpdateState::Ready,
            UpdateState::Downloaded,
            UpdateState::BadUrl,
            UpdateState::InvalidState,
        ] {
            assert_eq!(state.as_str().parse::<UpdateState>(), Ok(state));
        }
        assert_eq!("  Downloaded\r\n".parse::<UpdateState>(), Ok(UpdateState::Downloaded));
        assert_eq!("".parse::<UpdateState>(), Ok(UpdateState::None));
        assert!("half-done".parse::<UpdateState>().is_err());
        assert!(UpdateState::BadUrl.is_failure());
        assert!(!UpdateState::Downloaded.is_failure());
    }

    #[tokio::test]
    async fn test_store_load_clear() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(temp.path());

        let lock = UpdateLock::acquire(&path, false).await.unwrap();
        assert!(lock.is_locked());
        assert_eq!(lock.load().unwrap(), UpdateState::None);

        lock.store(UpdateState::Downloaded).unwrap();
        lock.store(UpdateState::Init).unwrap();
        assert_eq!(lock.load().unwrap(), UpdateState::Init);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "init");

        lock.clear().unwrap();
        assert_eq!(lock.load().unwrap(), UpdateState::None);
    }

    #[tokio::test]
    async fn test_second_acquisition_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(temp.path());

        let first = UpdateLock::acquire(&path, false).await.unwrap();
        first.store(UpdateState::Ready).unwrap();

        let err = UpdateLock::acquire_with_timeout(&path, false, SHORT).await.unwrap_err();
        assert!(matches!(err, StateError::AlreadyLocked { .. }));

        let forced = UpdateLock::acquire_with_timeout(&path, true, SHORT).await.unwrap();
        assert!(!forced.is_locked());
        drop(forced);

        first.release();
        let again = UpdateLock::acquire_with_timeout(&path, false, SHORT).await.unwrap();
        assert_eq!(again.load().unwrap(), UpdateState::Ready);
    }

    #[tokio::test]
    async fn test_state_survives_process_restart() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(temp.path());

        {
            let lock = UpdateLock::acquire(&path, false).await.unwrap();
            lock.store(UpdateState::Downloaded).unwrap();
        }

        assert_eq!(peek_state(&path).unwrap(), UpdateState::Downloaded);
        let lock = UpdateLock::acquire(&path, false).await.unwrap();
        assert_eq!(lock.load().unwrap(), UpdateState::Downloaded);
    }

    #[test]
    fn test_peek_malformed_and_missing() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(temp.path());
        assert_eq!(peek_state(&path).unwrap(), UpdateState::None);

        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "garbage").unwrap();
        assert!(matches!(peek_state(&path), Err(StateError::Malformed { .. })));
    }
}
