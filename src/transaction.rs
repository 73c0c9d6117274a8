//! Journaled filesystem transactions.
//!
//! An [`FsTransaction`] makes the replacement of many files all-or-nothing on
//! a filesystem without native transactions:
//!
//! 1. Records are written into a staging directory under
//!    `<root>/.handover/transactions/<id>/staged`, on the same filesystem as
//!    the targets. Nothing outside the transaction directory changes.
//! 2. [`FsTransaction::commit`] persists the journal in the `committing` phase,
//!    then swaps each unit: the current target moves into the transaction's
//!    backup area and the staged unit is renamed into place. The journal is
//!    persisted around every swap.
//! 3. If any swap fails, every unit already swapped is restored in reverse
//!    order and the transaction directory is removed.
//!
//! A unit is either a directory record, which replaces the whole directory, or
//! a file record that does not live under a directory record. After a crash,
//! [`recover`] discards uncommitted transactions and rolls back any found in
//! the `committing` phase. Committed transactions marked with
//! [`FsTransaction::keep_backup`] are handed back to the caller instead of
//! being deleted, since their backup area is the only copy of what they replaced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{TRANSACTIONS_DIR_NAME, WORK_DIR_NAME};
use crate::core::TransactionError;
use crate::utils::{atomic_write, path_exists, remove_path};

const JOURNAL_FILE: &str = "journal.json";
const STAGED_DIR: &str = "staged";
const BACKUP_DIR: &str = "backup";

/// Where transactions of the installation at `root` live.
pub fn transactions_dir(root: &Path) -> PathBuf {
    root.join(WORK_DIR_NAME).join(TRANSACTIONS_DIR_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionPhase {
    Staged,
    Committing,
    Committed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    File,
    Directory,
    /// Deletes the target without replacing it.
    Removal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Pending,
    Swapping,
    Swapped,
}

/// One top-level replacement performed by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionUnit {
    /// Relative path, `/`-separated.
    pub path: String,
    pub kind: UnitKind,
    pub state: UnitState,
    /// Whether a previous target was moved into the backup area.
    #[serde(default)]
    pub replaced: bool,
}

/// Persisted state of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionJournal {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub phase: TransactionPhase,
    pub units: Vec<TransactionUnit>,
    /// Directories created for new targets, outermost first.
    #[serde(default)]
    pub created_dirs: Vec<String>,
    /// The backup area outlives the commit.
    #[serde(default)]
    pub keep_backup: bool,
}

impl TransactionJournal {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            created_at: Utc::now(),
            phase: TransactionPhase::Staged,
            units: Vec::new(),
            created_dirs: Vec::new(),
            keep_backup: false,
        }
    }

    /// Reads the journal stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self, TransactionError> {
        let path = dir.join(JOURNAL_FILE);
        let bytes = fs::read(&path).map_err(|source| TransactionError::Io {
            operation: "read journal",
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| TransactionError::Journal {
            path,
            reason: e.to_string(),
        })
    }

    fn store(&self, dir: &Path) -> Result<(), TransactionError> {
        let path = dir.join(JOURNAL_FILE);
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| TransactionError::Journal {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        atomic_write(&path, &bytes).map_err(|source| TransactionError::Io {
            operation: "write journal",
            path,
            source,
        })
    }
}

/// Validates an entry name and returns it as a `/`-separated relative path.
///
/// Absolute paths, `..`, drive prefixes and anything inside the updater's own
/// work directory are rejected.
pub fn normalize_name(name: &str) -> Result<String, TransactionError> {
    let invalid = || TransactionError::InvalidPath {
        name: name.to_string(),
    };

    if name.starts_with('/') || name.starts_with('\\') {
        return Err(invalid());
    }

    let mut parts = Vec::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => return Err(invalid()),
            part if part.contains(':') => return Err(invalid()),
            part => parts.push(part),
        }
    }

    match parts.first() {
        None => Err(invalid()),
        Some(first) if first.eq_ignore_ascii_case(WORK_DIR_NAME) => Err(invalid()),
        Some(_) => Ok(parts.join("/")),
    }
}

fn join_relative(base: &Path, relative: &str) -> PathBuf {
    relative.split('/').fold(base.to_path_buf(), |path, part| path.join(part))
}

fn is_under(path: &str, dir: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

fn io_error(operation: &'static str, path: &Path) -> impl FnOnce(io::Error) -> TransactionError {
    let path = path.to_path_buf();
    move |source| TransactionError::Io {
        operation,
        path,
        source,
    }
}

/// A staged, not yet committed, set of changes to the tree at `root`.
///
/// Dropping an uncommitted transaction deletes its staging directory and
/// leaves the tree untouched.
#[derive(Debug)]
pub struct FsTransaction {
    root: PathBuf,
    dir: PathBuf,
    journal: TransactionJournal,
    finished: bool,
}

impl FsTransaction {
    /// Opens a new transaction on `root`.
    pub fn begin(root: &Path) -> Result<Self, TransactionError> {
        let journal = TransactionJournal::new();
        let dir = transactions_dir(root).join(&journal.id);
        let staged = dir.join(STAGED_DIR);
        fs::create_dir_all(&staged).map_err(io_error("create staging area", &staged))?;
        journal.store(&dir)?;

        debug!(id = %journal.id, "Began transaction in {}", dir.display());
        Ok(Self {
            root: root.to_path_buf(),
            dir,
            journal,
            finished: false,
        })
    }

    /// Marks the backup area as wanted after the commit, so [`recover`] returns
    /// the transaction instead of deleting it.
    #[must_use]
    pub fn keep_backup(mut self) -> Self {
        self.journal.keep_backup = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.journal.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    fn staged_path(&self, relative: &str) -> PathBuf {
        join_relative(&self.dir.join(STAGED_DIR), relative)
    }

    fn covered_by_directory(&self, relative: &str) -> bool {
        self.journal.units.iter().any(|unit| {
            unit.kind == UnitKind::Directory && (unit.path == relative || is_under(relative, &unit.path))
        })
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        if self.finished { Err(TransactionError::Finished) } else { Ok(()) }
    }

    /// Records that the directory `name` is replaced by whatever the
    /// transaction stages beneath it. The directory starts out empty.
    pub fn create_dir(&mut self, name: &str) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let relative = normalize_name(name)?;
        let staged = self.staged_path(&relative);

        if !self.covered_by_directory(&relative) {
            self.journal
                .units
                .retain(|unit| unit.path != relative && !is_under(&unit.path, &relative));

            // A file record staged under the same name.
            if fs::symlink_metadata(&staged).is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(&staged).map_err(io_error("replace staged file", &staged))?;
            }

            self.journal.units.push(TransactionUnit {
                path: relative.clone(),
                kind: UnitKind::Directory,
                state: UnitState::Pending,
                replaced: false,
            });
        }

        fs::create_dir_all(&staged).map_err(io_error("stage directory", &staged))
    }

    /// Stages the file `name` with `data`.
    pub fn write_file(&mut self, name: &str, data: &[u8]) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let relative = normalize_name(name)?;
        let staged = self.staged_path(&relative);

        if !self.covered_by_directory(&relative) {
            let existing = self.journal.units.iter().position(|unit| unit.path == relative);
            match existing {
                Some(index) => self.journal.units[index].kind = UnitKind::File,
                None => self.journal.units.push(TransactionUnit {
                    path: relative.clone(),
                    kind: UnitKind::File,
                    state: UnitState::Pending,
                    replaced: false,
                }),
            }
        }

        if let Some(parent) = staged.parent() {
            fs::create_dir_all(parent).map_err(io_error("stage directory", parent))?;
        }
        fs::write(&staged, data).map_err(io_error("stage file", &staged))
    }

    /// Records that `name` is deleted on commit.
    pub fn remove(&mut self, name: &str) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let relative = normalize_name(name)?;
        if self.covered_by_directory(&relative) {
            return Err(TransactionError::InvalidPath {
                name: name.to_string(),
            });
        }

        self.journal.units.retain(|unit| unit.path != relative && !is_under(&unit.path, &relative));
        self.journal.units.push(TransactionUnit {
            path: relative,
            kind: UnitKind::Removal,
            state: UnitState::Pending,
            replaced: false,
        });
        Ok(())
    }

    /// Applies every staged unit to the tree.
    ///
    /// On failure the tree is restored to its state before the call and the
    /// transaction is discarded.
    pub fn commit(mut self) -> Result<CommittedTransaction, TransactionError> {
        self.ensure_open()?;
        info!(
            id = %self.journal.id,
            units = self.journal.units.len(),
            "Committing transaction"
        );

        self.journal.phase = TransactionPhase::Committing;
        if let Err(e) = self.journal.store(&self.dir) {
            self.discard();
            return Err(e);
        }

        for index in 0..self.journal.units.len() {
            if let Err(e) = self.swap_unit(index) {
                warn!(id = %self.journal.id, "Commit failed, rolling back: {}", e);
                return Err(self.abort(e));
            }
        }

        self.journal.phase = TransactionPhase::Committed;
        if let Err(e) = self.journal.store(&self.dir) {
            return Err(self.abort(e));
        }

        self.finished = true;
        let staged = self.dir.join(STAGED_DIR);
        if let Err(e) = remove_path(&staged) {
            warn!("Unable to remove staging area {}: {}", staged.display(), e);
        }

        info!(id = %self.journal.id, "Transaction committed");
        Ok(CommittedTransaction {
            dir: self.dir.clone(),
            journal: self.journal.clone(),
        })
    }

    fn swap_unit(&mut self, index: usize) -> Result<(), TransactionError> {
        let unit = self.journal.units[index].clone();
        let target = join_relative(&self.root, &unit.path);
        let staged = self.staged_path(&unit.path);
        let backup = join_relative(&self.dir.join(BACKUP_DIR), &unit.path);

        let missing = missing_parents(&self.root, &unit.path);
        self.journal.created_dirs.extend(missing.iter().cloned());
        self.journal.units[index].state = UnitState::Swapping;
        self.journal.store(&self.dir)?;

        for dir in &missing {
            let path = join_relative(&self.root, dir);
            fs::create_dir(&path).map_err(io_error("create directory", &path))?;
        }

        if path_exists(&target) {
            if let Some(parent) = backup.parent() {
                fs::create_dir_all(parent).map_err(io_error("create backup area", parent))?;
            }
            fs::rename(&target, &backup).map_err(io_error("move target to backup", &target))?;
            self.journal.units[index].replaced = true;
        }

        if unit.kind != UnitKind::Removal {
            fs::rename(&staged, &target).map_err(io_error("move staged target into place", &target))?;
        }

        debug!(path = %unit.path, kind = ?unit.kind, "Swapped unit");
        self.journal.units[index].state = UnitState::Swapped;
        self.journal.store(&self.dir)
    }

    fn abort(&mut self, error: TransactionError) -> TransactionError {
        self.finished = true;
        match undo_units(&self.root, &self.dir, &self.journal) {
            Ok(()) => {
                self.discard();
                error
            }
            Err(reason) => TransactionError::RollbackFailed {
                id: self.journal.id.clone(),
                reason: format!("{error}; {reason}"),
            },
        }
    }

    /// Discards the transaction without touching the tree.
    pub fn rollback(mut self) -> Result<(), TransactionError> {
        self.ensure_open()?;
        self.finished = true;
        debug!(id = %self.journal.id, "Rolling back uncommitted transaction");
        remove_path(&self.dir).map_err(io_error("remove transaction", &self.dir))
    }

    fn discard(&mut self) {
        self.finished = true;
        if let Err(e) = remove_path(&self.dir) {
            warn!("Unable to remove transaction {}: {}", self.dir.display(), e);
        }
    }
}

impl Drop for FsTransaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(id = %self.journal.id, "Discarding uncommitted transaction");
            self.discard();
        }
    }
}

/// Result of a successful commit: the backup area holding every replaced
/// target, plus the journal describing the units.
#[derive(Debug)]
pub struct CommittedTransaction {
    dir: PathBuf,
    journal: TransactionJournal,
}

impl CommittedTransaction {
    pub fn journal(&self) -> &TransactionJournal {
        &self.journal
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory holding the replaced targets, mirroring their relative paths.
    pub fn backup_dir(&self) -> PathBuf {
        self.dir.join(BACKUP_DIR)
    }

    /// Deletes the transaction directory, backup area included.
    pub fn discard(self) -> Result<(), TransactionError> {
        remove_path(&self.dir).map_err(io_error("remove transaction", &self.dir))
    }
}

fn missing_parents(root: &Path, relative: &str) -> Vec<String> {
    let parts: Vec<&str> = relative.split('/').collect();
    let mut missing = Vec::new();
    for end in 1..parts.len() {
        let prefix = parts[..end].join("/");
        if !path_exists(&join_relative(root, &prefix)) {
            missing.push(prefix);
        }
    }
    missing
}

// Restores every unit that started swapping, newest first. The filesystem,
// not the journal, says how far each swap got.
fn undo_units(root: &Path, dir: &Path, journal: &TransactionJournal) -> Result<(), String> {
    let mut failures = Vec::new();
    let staged_root = dir.join(STAGED_DIR);
    let backup_root = dir.join(BACKUP_DIR);

    for unit in journal.units.iter().rev().filter(|u| u.state != UnitState::Pending) {
        let target = join_relative(root, &unit.path);
        let staged = join_relative(&staged_root, &unit.path);
        let backup = join_relative(&backup_root, &unit.path);

        let result = if path_exists(&backup) {
            remove_path(&target).and_then(|()| fs::rename(&backup, &target))
        } else if unit.kind != UnitKind::Removal && !path_exists(&staged) {
            remove_path(&target)
        } else {
            Ok(())
        };

        match result {
            Ok(()) => debug!(path = %unit.path, "Restored unit"),
            Err(e) => failures.push(format!("{}: {}", unit.path, e)),
        }
    }

    for created in journal.created_dirs.iter().rev() {
        // Only empty directories; anything else was there before.
        let _ = fs::remove_dir(join_relative(root, created));
    }

    if failures.is_empty() { Ok(()) } else { Err(failures.join(", ")) }
}

/// What [`recover`] found.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Uncommitted or unreadable transactions that were deleted.
    pub discarded: usize,
    /// Interrupted commits that were rolled back.
    pub rolled_back: usize,
    /// Committed transactions found after the commit.
    pub completed: usize,
    /// Committed transactions whose backup area is still wanted, oldest first.
    pub committed: Vec<CommittedTransaction>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.discarded == 0 && self.rolled_back == 0 && self.completed == 0
    }
}

/// Cleans up after transactions interrupted by a crash or forced termination.
pub fn recover(root: &Path) -> Result<RecoveryReport, TransactionError> {
    let dir = transactions_dir(root);
    let mut report = RecoveryReport::default();

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(source) => {
            return Err(TransactionError::Io {
                operation: "list transactions",
                path: dir,
                source,
            });
        }
    };

    for entry in entries {
        let path = entry.map_err(io_error("list transactions", &dir))?.path();

        match TransactionJournal::load(&path) {
            Ok(journal) if journal.phase == TransactionPhase::Committing => {
                warn!(id = %journal.id, "Rolling back interrupted commit");
                undo_units(root, &path, &journal).map_err(|reason| TransactionError::RollbackFailed {
                    id: journal.id.clone(),
                    reason,
                })?;
                report.rolled_back += 1;
            }
            Ok(journal) if journal.phase == TransactionPhase::Committed && journal.keep_backup => {
                debug!(id = %journal.id, "Keeping backup of committed transaction");
                report.completed += 1;
                report.committed.push(CommittedTransaction {
                    dir: path,
                    journal,
                });
                continue;
            }
            Ok(journal) if journal.phase == TransactionPhase::Committed => {
                debug!(id = %journal.id, "Removing leftovers of committed transaction");
                report.completed += 1;
            }
            Ok(journal) => {
                debug!(id = %journal.id, "Discarding uncommitted transaction");
                report.discarded += 1;
            }
            Err(e) => {
                warn!("Discarding unreadable transaction {}: {}", path.display(), e);
                report.discarded += 1;
            }
        }

        remove_path(&path).map_err(io_error("remove transaction", &path))?;
    }

    report.committed.sort_by_key(|c| c.journal.created_at);
    if !report.is_empty() {
        info!(
            discarded = report.discarded,
            rolled_back = report.rolled_back,
            completed = report.completed,
            "Recovered stale transactions"
        );
    }
    Ok(report)
}
