//! The single retained previous version.
//!
//! After a successful unpack the files it replaced are kept under
//! `<root>/.handover/previous`, together with the journal of the transaction
//! that replaced them. [`PreviousVersion::restore`] puts them back through a
//! new transaction, removes anything the update added, and deletes the
//! backup, so a version can be restored exactly once.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::constants::{PREVIOUS_DIR_NAME, RESTORE_ATTEMPTS, WORK_DIR_NAME};
use crate::core::{BackupError, TransactionError};
use crate::transaction::{
    CommittedTransaction, FsTransaction, RecoveryReport, TransactionJournal, UnitKind, UnitState,
    recover,
};
use crate::utils::{atomic_write, copy_path, path_exists, remove_path};

const MANIFEST_FILE: &str = "manifest.json";
const FILES_DIR: &str = "files";

/// Handle on the retained backup of the installation at `root`.
#[derive(Debug, Clone)]
pub struct PreviousVersion {
    root: PathBuf,
    dir: PathBuf,
    retry_delay: Duration,
}

impl PreviousVersion {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            dir: root.join(WORK_DIR_NAME).join(PREVIOUS_DIR_NAME),
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Delay between restore attempts (1 second by default).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_available(&self) -> bool {
        self.dir.join(MANIFEST_FILE).is_file()
    }

    /// Journal of the update that produced the retained backup.
    pub fn manifest(&self) -> Result<Option<TransactionJournal>, BackupError> {
        let path = self.dir.join(MANIFEST_FILE);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(BackupError::Io {
                    path,
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            BackupError::Transaction(TransactionError::Journal {
                path,
                reason: e.to_string(),
            })
        })
    }

    /// Keeps the files replaced by `committed`, discarding any older backup.
    pub fn retain(&self, committed: CommittedTransaction) -> Result<(), BackupError> {
        remove_path(&self.dir).map_err(io_error(&self.dir))?;
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let files = self.dir.join(FILES_DIR);
        let backup = committed.backup_dir();
        if path_exists(&backup) {
            if let Err(e) = fs::rename(&backup, &files) {
                debug!("Moving backup failed ({}), copying instead", e);
                copy_path(&backup, &files).map_err(io_error(&files))?;
            }
        } else {
            fs::create_dir_all(&files).map_err(io_error(&files))?;
        }

        let manifest = self.dir.join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(committed.journal()).map_err(|e| {
            BackupError::Transaction(TransactionError::Journal {
                path: manifest.clone(),
                reason: e.to_string(),
            })
        })?;
        atomic_write(&manifest, &bytes).map_err(io_error(&manifest))?;

        info!(
            units = committed.journal().units.len(),
            "Retained previous version in {}",
            self.dir.display()
        );
        committed.discard()?;
        Ok(())
    }

    /// Retains transactions that committed without reaching [`retain`](Self::retain),
    /// oldest first, so the newest one ends up as the previous version.
    ///
    /// A transaction whose journal is already the manifest was interrupted
    /// after its backup was taken and is only discarded. Returns the number of
    /// transactions retained.
    pub fn retain_recovered(&self, committed: Vec<CommittedTransaction>) -> Result<usize, BackupError> {
        let mut retained = 0;
        for transaction in committed {
            let current = self.manifest().ok().flatten().map(|journal| journal.id);
            if current.as_deref() == Some(transaction.journal().id.as_str()) {
                debug!(id = %transaction.journal().id, "Backup already retained");
                transaction.discard()?;
            } else {
                self.retain(transaction)?;
                retained += 1;
            }
        }
        Ok(retained)
    }

    /// Restores the retained version, then deletes it.
    ///
    /// Attempted up to three times, one second apart. Fails with
    /// [`BackupError::NoBackup`] when nothing is retained.
    pub async fn restore(&self) -> Result<(), BackupError> {
        let journal = self.manifest()?.ok_or(BackupError::NoBackup)?;
        info!(id = %journal.id, "Restoring previous version");

        let mut attempt = 1;
        loop {
            let this = self.clone();
            let manifest = journal.clone();
            let result = tokio::task::spawn_blocking(move || this.apply(&manifest))
                .await
                .map_err(|e| TransactionError::RollbackFailed {
                    id: journal.id.clone(),
                    reason: e.to_string(),
                })
                .and_then(|result| result);

            match result {
                Ok(()) => break,
                Err(source) if attempt >= RESTORE_ATTEMPTS => {
                    return Err(BackupError::RestoreFailed {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    warn!(attempt, "Restore attempt failed: {}", e);
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
            }
        }

        remove_path(&self.dir).map_err(|source| BackupError::Io {
            path: self.dir.clone(),
            source,
        })?;
        info!("Previous version restored");
        Ok(())
    }

    fn apply(&self, journal: &TransactionJournal) -> Result<(), TransactionError> {
        let files = self.dir.join(FILES_DIR);
        let mut transaction = FsTransaction::begin(&self.root)?;

        for unit in journal.units.iter().filter(|u| u.state == UnitState::Swapped) {
            if !unit.replaced {
                transaction.remove(&unit.path)?;
                continue;
            }

            let source = unit.path.split('/').fold(files.clone(), |path, part| path.join(part));
            match unit.kind {
                UnitKind::Directory => stage_tree(&mut transaction, &source, &unit.path)?,
                UnitKind::File | UnitKind::Removal => {
                    if source.is_dir() {
                        stage_tree(&mut transaction, &source, &unit.path)?;
                    } else {
                        let data = read(&source)?;
                        transaction.write_file(&unit.path, &data)?;
                    }
                }
            }
        }

        transaction.commit()?.discard()?;

        for created in journal.created_dirs.iter().rev() {
            let path = created.split('/').fold(self.root.clone(), |path, part| path.join(part));
            let _ = fs::remove_dir(path);
        }
        Ok(())
    }
}

/// Recovers interrupted transactions of the installation at `root`.
///
/// Backups of updates that committed but were never retained become the
/// previous version; failing to retain one is logged and retried on the next
/// recovery.
pub fn recover_installation(root: &Path) -> Result<RecoveryReport, TransactionError> {
    let mut report = recover(root)?;
    let committed = std::mem::take(&mut report.committed);
    if !committed.is_empty() {
        match PreviousVersion::new(root).retain_recovered(committed) {
            Ok(retained) => info!(retained, "Retained the previous version of an interrupted update"),
            Err(e) => warn!("Unable to retain the previous version of an interrupted update: {}", e),
        }
    }
    Ok(report)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError {
    let path = path.to_path_buf();
    move |source| BackupError::Io {
        path,
        source,
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TransactionError> {
    fs::read(path).map_err(|source| TransactionError::Io {
        operation: "read backup",
        path: path.to_path_buf(),
        source,
    })
}

fn stage_tree(
    transaction: &mut FsTransaction,
    source: &Path,
    relative: &str,
) -> Result<(), TransactionError> {
    transaction.create_dir(relative)?;

    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| TransactionError::Io {
            operation: "read backup",
            path: source.to_path_buf(),
            source: std::io::Error::other(e),
        })?;
        let inner = entry.path().strip_prefix(source).map_err(|e| TransactionError::Io {
            operation: "read backup",
            path: entry.path().to_path_buf(),
            source: std::io::Error::other(e),
        })?;
        let name = format!("{}/{}", relative, inner.to_string_lossy().replace('\\', "/"));

        if entry.file_type().is_dir() {
            transaction.create_dir(&name)?;
        } else if entry.file_type().is_file() {
            transaction.write_file(&name, &read(entry.path())?)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobEntry, BlobLayout, TransferBlob};
    use crate::test_utils::{snapshot_tree, write_tree};
    use crate::unpack::Unpacker;
    use tempfile::TempDir;

    fn installed(root: &Path) {
        write_tree(
            root,
            &[
                ("launcher", b"v1 launcher"),
                ("resources/a.txt", b"v1 a"),
                ("resources/deep/b.txt", b"v1 b"),
                ("notes.txt", b"untouched"),
            ],
        );
    }

    fn update(root: &Path, launcher: &[u8]) {
        let blob = TransferBlob::new(vec![
            BlobEntry::file("launcher", launcher.to_vec()),
            BlobEntry::directory("resources/"),
            BlobEntry::file("resources/a.txt", b"v2 a".to_vec()),
            BlobEntry::file("plugins/new.dll", b"added".to_vec()),
        ]);
        let bytes = blob.to_bytes(BlobLayout::Tagged).unwrap();
        let outcome = Unpacker::new(root).unpack(bytes.as_slice()).unwrap();
        PreviousVersion::new(root).retain(outcome.transaction).unwrap();
    }

    #[tokio::test]
    async fn test_restore_works_once() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        installed(root);
        let before = snapshot_tree(root, &[WORK_DIR_NAME]);

        update(root, b"v2 launcher");
        assert_eq!(fs::read(root.join("launcher")).unwrap(), b"v2 launcher");
        let previous = PreviousVersion::new(root);
        assert!(previous.is_available());

        previous.restore().await.unwrap();
        assert_eq!(snapshot_tree(root, &[WORK_DIR_NAME]), before);
        assert!(!previous.is_available());

        assert!(matches!(previous.restore().await, Err(BackupError::NoBackup)));
    }

    #[tokio::test]
    async fn test_retain_replaces_older_backup() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        installed(root);

        update(root, b"v2 launcher");
        update(root, b"v3 launcher");

        PreviousVersion::new(root).restore().await.unwrap();
        assert_eq!(fs::read(root.join("launcher")).unwrap(), b"v2 launcher");
        assert_eq!(fs::read(root.join("resources/a.txt")).unwrap(), b"v2 a");
    }

    #[tokio::test]
    async fn test_restore_gives_up_after_attempts() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        installed(root);
        update(root, b"v2 launcher");

        let previous = PreviousVersion::new(root).with_retry_delay(Duration::from_millis(1));
        fs::remove_file(previous.dir().join(FILES_DIR).join("launcher")).unwrap();

        let err = previous.restore().await.unwrap_err();
        assert!(matches!(err, BackupError::RestoreFailed { attempts: 3, .. }));
        assert!(previous.is_available());
        assert_eq!(fs::read(root.join("launcher")).unwrap(), b"v2 launcher");
    }

    #[tokio::test]
    async fn test_recovery_retains_backup_of_interrupted_update() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        installed(root);
        let before = snapshot_tree(root, &[WORK_DIR_NAME]);

        let blob = TransferBlob::new(vec![BlobEntry::file("launcher", b"v2 launcher".to_vec())]);
        let bytes = blob.to_bytes(BlobLayout::Tagged).unwrap();
        // Committed, then the process died before retaining the backup.
        drop(Unpacker::new(root).unpack(bytes.as_slice()).unwrap());
        assert!(!PreviousVersion::new(root).is_available());

        let report = recover_installation(root).unwrap();
        assert_eq!(report.completed, 1);
        let previous = PreviousVersion::new(root);
        assert!(previous.is_available());
        assert!(recover(root).unwrap().is_empty());

        previous.restore().await.unwrap();
        assert_eq!(snapshot_tree(root, &[WORK_DIR_NAME]), before);
    }

    #[tokio::test]
    async fn test_recovery_keeps_backup_already_retained() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        installed(root);

        let blob = TransferBlob::new(vec![BlobEntry::file("launcher", b"v2 launcher".to_vec())]);
        let bytes = blob.to_bytes(BlobLayout::Tagged).unwrap();
        let outcome = Unpacker::new(root).unpack(bytes.as_slice()).unwrap();
        let transaction_dir = outcome.transaction.dir().to_path_buf();
        let journal = outcome.transaction.journal().clone();
        PreviousVersion::new(root).retain(outcome.transaction).unwrap();

        // Died after the manifest was written but before the transaction was removed.
        fs::create_dir_all(&transaction_dir).unwrap();
        fs::write(transaction_dir.join("journal.json"), serde_json::to_vec(&journal).unwrap()).unwrap();

        recover_installation(root).unwrap();
        assert!(recover(root).unwrap().is_empty());

        PreviousVersion::new(root).restore().await.unwrap();
        assert_eq!(fs::read(root.join("launcher")).unwrap(), b"v1 launcher");
    }

    #[tokio::test]
    async fn test_nothing_retained() {
        let temp = TempDir::new().unwrap();
        let previous = PreviousVersion::new(temp.path());
        assert!(previous.manifest().unwrap().is_none());
        assert!(matches!(previous.restore().await, Err(BackupError::NoBackup)));
    }
}
