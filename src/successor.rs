//! Successor-process side of the update.
//!
//! The successor is a staged copy of this executable started by the current
//! process with `handover unpack`. It takes the handoff, terminates the
//! launcher, applies the blob atomically, keeps the replaced files as the
//! previous version and finally starts the updated launcher.

use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backup::{PreviousVersion, recover_installation};
use crate::config::UpdaterConfig;
use crate::core::UpdateError;
use crate::handoff::synchronize;
use crate::layout::InstallLayout;
use crate::state::UpdateLock;
use crate::unpack::Unpacker;
use crate::utils::remove_path;

/// Arguments of one successor run.
#[derive(Debug, Clone)]
pub struct SuccessorOptions {
    pub blob: PathBuf,
    /// Skip the handoff; used when rerunning an interrupted unpack by hand.
    pub resume: bool,
    /// Continue when another process holds the update lock.
    pub force_lock: bool,
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessorOutcome {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
    /// Process terminated through the handoff.
    pub terminated: Option<u32>,
    /// Process id of the relaunched launcher.
    pub relaunched: Option<u32>,
    pub backup_retained: bool,
}

struct Applied {
    files: usize,
    directories: usize,
    bytes: u64,
    backup_retained: bool,
}

pub struct Successor {
    layout: InstallLayout,
    config: UpdaterConfig,
}

impl Successor {
    pub fn new(layout: InstallLayout, config: UpdaterConfig) -> Self {
        Self {
            layout,
            config,
        }
    }

    /// Runs the successor.
    ///
    /// When the launcher was terminated through the handoff and the update
    /// then fails, the installed version is started again before the error is
    /// returned.
    pub async fn run(&self, options: &SuccessorOptions) -> Result<SuccessorOutcome, UpdateError> {
        let lock = UpdateLock::acquire(&self.layout.lock_file(), options.force_lock).await?;

        let terminated = if options.resume {
            info!("Resuming unpack without handoff");
            None
        } else {
            let pid = synchronize(&self.config.handoff_config()).await?;
            info!(pid, "Launcher terminated");
            Some(pid)
        };

        let applied = match self.apply(options, lock).await {
            Ok(applied) => applied,
            Err(e) => {
                if terminated.is_some() && self.config.relaunch {
                    warn!("Update failed, starting the installed version again: {}", e);
                    match self.relaunch() {
                        Ok(pid) => info!(pid, "Installed version restarted"),
                        Err(relaunch) => warn!("Unable to restart the installed version: {}", relaunch),
                    }
                }
                return Err(e);
            }
        };

        let relaunched = if self.config.relaunch { Some(self.relaunch()?) } else { None };

        Ok(SuccessorOutcome {
            files: applied.files,
            directories: applied.directories,
            bytes: applied.bytes,
            terminated,
            relaunched,
            backup_retained: applied.backup_retained,
        })
    }

    async fn apply(&self, options: &SuccessorOptions, lock: UpdateLock) -> Result<Applied, UpdateError> {
        let root = self.layout.root().to_path_buf();
        let report = recover_installation(&root)?;
        if !report.is_empty() {
            info!(
                discarded = report.discarded,
                rolled_back = report.rolled_back,
                completed = report.completed,
                "Recovered interrupted transactions"
            );
        }

        let unpacker = Unpacker::new(&root);
        let blob = options.blob.clone();
        let outcome = tokio::task::spawn_blocking(move || unpacker.unpack_file(&blob))
            .await
            .map_err(|e| UpdateError::Io {
                operation: "unpack",
                path: options.blob.clone(),
                source: std::io::Error::other(e),
            })??;

        let (files, directories, bytes) = (outcome.files, outcome.directories, outcome.bytes);
        let backup_retained = match PreviousVersion::new(&root).retain(outcome.transaction) {
            Ok(()) => true,
            Err(e) => {
                warn!("Unable to retain the previous version: {}", e);
                false
            }
        };

        self.clean_up(options);
        lock.clear()?;
        lock.release();

        Ok(Applied {
            files,
            directories,
            bytes,
            backup_retained,
        })
    }

    fn clean_up(&self, options: &SuccessorOptions) {
        for path in [
            options.blob.clone(),
            self.layout.extract_dir(),
            self.layout.download(&self.config.archive_asset),
        ] {
            match remove_path(&path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) => warn!("Unable to remove {}: {}", path.display(), e),
            }
        }
    }

    fn relaunch(&self) -> Result<u32, UpdateError> {
        let launcher = self.layout.launcher(&self.config.launcher_exe);
        info!("Starting {}", launcher.display());

        let child = Command::new(&launcher)
            .current_dir(self.layout.root())
            .spawn()
            .map_err(|source| UpdateError::Relaunch {
                path: launcher.clone(),
                source,
            })?;
        Ok(child.id().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobEntry, BlobLayout, TransferBlob};
    use crate::constants::WORK_DIR_NAME;
    use crate::core::{BlobError, UnpackError};
    use crate::state::{UpdateState, peek_state};
    use crate::test_utils::{snapshot_tree, write_tree};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn stage(root: &Path) -> (InstallLayout, PathBuf) {
        write_tree(root, &[("launcher", b"old"), ("assets/old.png", b"old png")]);
        let layout = InstallLayout::new(root);
        let bytes = TransferBlob::new(vec![
            BlobEntry::file("launcher", b"new".to_vec()),
            BlobEntry::directory("assets/"),
            BlobEntry::file("assets/new.png", b"new png".to_vec()),
        ])
        .to_bytes(BlobLayout::Tagged)
        .unwrap();
        fs::create_dir_all(layout.work_dir()).unwrap();
        fs::write(layout.blob(), bytes).unwrap();
        fs::write(layout.lock_file(), "downloaded").unwrap();
        let blob = layout.blob();
        (layout, blob)
    }

    fn config() -> UpdaterConfig {
        UpdaterConfig {
            launcher_exe: "launcher".to_string(),
            relaunch: false,
            ..UpdaterConfig::default()
        }
    }

    fn options(blob: PathBuf) -> SuccessorOptions {
        SuccessorOptions {
            blob,
            resume: true,
            force_lock: false,
        }
    }

    #[tokio::test]
    async fn test_resume_applies_blob_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let (layout, blob) = stage(root);
        fs::create_dir_all(layout.extract_dir()).unwrap();

        let outcome = Successor::new(layout.clone(), config()).run(&options(blob.clone())).await.unwrap();
        assert_eq!(outcome.files, 2);
        assert_eq!(outcome.directories, 1);
        assert!(outcome.backup_retained);
        assert_eq!(outcome.terminated, None);
        assert_eq!(outcome.relaunched, None);

        assert_eq!(fs::read(root.join("launcher")).unwrap(), b"new");
        assert!(!root.join("assets/old.png").exists());
        assert!(!blob.exists());
        assert!(!layout.extract_dir().exists());
        assert_eq!(peek_state(&layout.lock_file()).unwrap(), UpdateState::None);
        assert!(PreviousVersion::new(root).is_available());
    }

    #[tokio::test]
    async fn test_failed_unpack_keeps_state_for_retry() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let (layout, blob) = stage(root);
        let bytes = fs::read(&blob).unwrap();
        fs::write(&blob, &bytes[..bytes.len() - 2]).unwrap();
        let before = snapshot_tree(root, &[WORK_DIR_NAME]);

        let err = Successor::new(layout.clone(), config()).run(&options(blob.clone())).await.unwrap_err();
        assert!(matches!(err, UpdateError::Unpack(UnpackError::Blob(BlobError::Truncated { .. }))));
        assert_eq!(snapshot_tree(root, &[WORK_DIR_NAME]), before);
        assert!(blob.exists());
        assert_eq!(peek_state(&layout.lock_file()).unwrap(), UpdateState::Downloaded);
    }

    #[tokio::test]
    async fn test_missing_launcher_fails_relaunch() {
        let temp = TempDir::new().unwrap();
        let (layout, blob) = stage(temp.path());
        let config = UpdaterConfig {
            launcher_exe: "not-there".to_string(),
            relaunch: true,
            ..UpdaterConfig::default()
        };

        let err = Successor::new(layout, config).run(&options(blob)).await.unwrap_err();
        assert!(matches!(err, UpdateError::Relaunch { .. }));
        assert_eq!(fs::read(temp.path().join("launcher")).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handoff_terminates_previous_process() {
        use crate::handoff::{ChannelListener, Finalizer, HandoffStatus};

        let temp = TempDir::new().unwrap();
        let (layout, blob) = stage(temp.path());
        let mut config = config();
        config.handoff.channel_name = format!("handover_test_{}", uuid::Uuid::new_v4().simple());

        let mut sleeper = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = sleeper.id();

        let listener = ChannelListener::create(&config.handoff.channel_name).unwrap();
        let mut finalizer = Finalizer::new(listener, None, config.handoff_config()).with_pid(pid);
        let driver = tokio::spawn(async move {
            while finalizer.resume().await.unwrap() != HandoffStatus::WaitingForTermination {}
        });

        let outcome = Successor::new(layout, config)
            .run(&SuccessorOptions {
                blob,
                resume: false,
                force_lock: false,
            })
            .await
            .unwrap();
        driver.await.unwrap();

        assert_eq!(outcome.terminated, Some(pid));
        assert!(!sleeper.wait().unwrap().success());
        assert_eq!(fs::read(temp.path().join("launcher")).unwrap(), b"new");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_update_restarts_installed_version() {
        use crate::handoff::{ChannelListener, Finalizer, HandoffStatus};
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let (layout, blob) = stage(root);
        let launcher = root.join("launcher");
        fs::write(&launcher, "#!/bin/sh\necho restarted > restarted\n").unwrap();
        fs::set_permissions(&launcher, fs::Permissions::from_mode(0o755)).unwrap();
        let bytes = fs::read(&blob).unwrap();
        fs::write(&blob, &bytes[..bytes.len() - 2]).unwrap();

        let mut config = config();
        config.relaunch = true;
        config.handoff.channel_name = format!("handover_test_{}", uuid::Uuid::new_v4().simple());

        let mut sleeper = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = sleeper.id();

        let listener = ChannelListener::create(&config.handoff.channel_name).unwrap();
        let mut finalizer = Finalizer::new(listener, None, config.handoff_config()).with_pid(pid);
        let driver = tokio::spawn(async move {
            while finalizer.resume().await.unwrap() != HandoffStatus::WaitingForTermination {}
        });

        let err = Successor::new(layout.clone(), config)
            .run(&SuccessorOptions {
                blob,
                resume: false,
                force_lock: false,
            })
            .await
            .unwrap_err();
        driver.await.unwrap();

        assert!(matches!(err, UpdateError::Unpack(UnpackError::Blob(BlobError::Truncated { .. }))));
        assert!(!sleeper.wait().unwrap().success());
        assert_eq!(peek_state(&layout.lock_file()).unwrap(), UpdateState::Downloaded);

        let marker = root.join("restarted");
        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert!(marker.exists(), "installed launcher was not restarted");
    }
}
