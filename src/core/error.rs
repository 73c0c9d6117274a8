//! Error handling for handover
//!
//! Every stage of the update pipeline has its own strongly-typed error enum, so
//! callers can tell a transport hiccup from an integrity failure or a protocol
//! mismatch without inspecting strings. [`UpdateError`] wraps the per-stage
//! enums and is the only error the orchestrators return.
//!
//! # Error Categories
//!
//! - **Transport**: [`DownloadError`], transport-like [`HandoffError`] variants.
//!   Terminal for one download attempt, retried a bounded number of times for
//!   the handoff.
//! - **Integrity**: [`IntegrityError`]. Always terminal for the attempt.
//! - **Protocol**: [`HandoffError::BadMessage`]. Terminal, never retried: a
//!   malformed message means the two processes come from different builds.
//! - **Filesystem**: [`TransactionError`], [`UnpackError`]. The transaction is
//!   rolled back; nothing is ever reported as partially applied.
//!
//! Use [`user_friendly_error`] at the CLI boundary to turn any error into an
//! [`ErrorContext`] with a suggestion.
//!
//! # Examples
//!
//! ```rust,no_run
//! use handover::core::{IntegrityError, UpdateError, user_friendly_error};
//!
//! let error = UpdateError::from(IntegrityError::EmptyChecksum);
//! let ctx = user_friendly_error(anyhow::Error::from(error));
//! ctx.display();
//! ```

use colored::Colorize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::transpile::TranspileReport;

/// Failures of the release resolver.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Failed to fetch release information from {url}: {reason}")]
    FetchFailed {
        url: String,
        reason: String,
    },

    #[error("Release {version} contains neither a checksum file nor an update archive")]
    NoAssets {
        version: String,
    },

    #[error("Release {version} has no checksum asset named '{asset}'")]
    MissingChecksum {
        version: String,
        asset: String,
    },

    #[error("Release {version} has no archive asset named '{asset}'")]
    MissingArchive {
        version: String,
        asset: String,
    },

    #[error("No release matches the selection policy")]
    NoRelease,
}

/// Failures of a single download session.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Transfer from {url} failed: {reason}")]
    Transport {
        url: String,
        reason: String,
    },

    #[error("Server answered HTTP {status} for {url}")]
    BadStatus {
        url: String,
        status: u16,
    },

    #[error("Unable to store downloaded data in {path}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Body of {url} does not match its announced length: expected {expected} bytes, received {received}")]
    LengthMismatch {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error("Download from {url} was aborted")]
    Aborted {
        url: String,
    },

    #[error("The request executor has been stopped")]
    ExecutorStopped,

    #[error("Worker for download '{name}' ended without reporting a result")]
    WorkerLost {
        name: String,
    },
}

/// Failures of the integrity verifier.
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Unable to compute the digest of {path}")]
    BadHash {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, computed {actual}")]
    Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("The published checksum is empty")]
    EmptyChecksum,
}

/// Failures while encoding or decoding a transfer blob.
#[derive(Error, Debug)]
pub enum BlobError {
    #[error("I/O error on transfer blob")]
    Io(#[from] io::Error),

    #[error("Transfer blob is truncated while reading {what} of record {index}")]
    Truncated {
        what: &'static str,
        index: usize,
    },

    #[error("Transfer blob declares a negative record count ({0})")]
    NegativeCount(i32),

    #[error("Record {index} has a name that is not valid UTF-8")]
    InvalidName {
        index: usize,
    },

    #[error("Record {index} has unknown kind tag {tag}")]
    UnknownKind {
        index: usize,
        tag: u8,
    },

    #[error("Unsupported transfer blob version {0}")]
    UnsupportedVersion(u8),

    #[error("Entry '{name}' is an empty file whose name ends with a path separator; the legacy layout cannot represent it")]
    AmbiguousEntry {
        name: String,
    },

    #[error("Too many records for a transfer blob ({0})")]
    TooManyRecords(usize),
}

/// Failures of the archive transpiler.
#[derive(Error, Debug)]
pub enum TranspileError {
    #[error("Unable to open archive {path}: {reason}")]
    OpenArchive {
        path: PathBuf,
        reason: String,
    },

    #[error("Archive does not contain the launcher executable '{launcher}'")]
    MissingLauncher {
        launcher: String,
        report: TranspileReport,
    },

    #[error("{failed} archive entries could not be extracted")]
    EntryFailures {
        failed: usize,
        report: TranspileReport,
    },

    #[error("Unable to write transpiler output {path}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// Failures of the process handoff protocol.
#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("Handoff channel '{name}' is already owned by another process")]
    ChannelBusy {
        name: String,
    },

    #[error("Handoff channel error during {operation}")]
    Channel {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to handoff channel '{name}'")]
    ConnectTimeout {
        name: String,
    },

    #[error("Timed out waiting for '{expected}'")]
    ReadTimeout {
        expected: &'static str,
    },

    #[error("Timed out sending '{message}'")]
    WriteTimeout {
        message: &'static str,
    },

    #[error("Peer closed the channel while '{expected}' was expected")]
    PeerClosed {
        expected: &'static str,
    },

    #[error("Bad handoff message: expected '{expected}', received {received:?}")]
    BadMessage {
        expected: &'static str,
        received: String,
    },

    #[error("Handoff cannot be resumed: {reason}")]
    InvalidResume {
        reason: &'static str,
    },

    #[error("Unable to start successor {path}")]
    SpawnSuccessor {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Successor process exited before completing the handoff ({status})")]
    SuccessorExited {
        status: String,
    },

    #[error("Unable to terminate process {pid}")]
    Terminate {
        pid: u32,
    },

    #[error("Process {pid} did not exit in time")]
    WaitProcess {
        pid: u32,
    },

    #[error("Interrupted while waiting for the successor to take over")]
    Interrupted,
}

impl HandoffError {
    /// Whether the caller may retry the handoff after this error.
    ///
    /// Protocol errors are never retryable: they indicate a build mismatch.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Channel { .. }
                | Self::ConnectTimeout { .. }
                | Self::ReadTimeout { .. }
                | Self::ChannelBusy { .. }
        )
    }
}

/// Failures of a filesystem transaction.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {operation} failed on {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Transaction journal {path} is unreadable: {reason}")]
    Journal {
        path: PathBuf,
        reason: String,
    },

    #[error("Entry name '{name}' is not a safe relative path")]
    InvalidPath {
        name: String,
    },

    #[error("Transaction has already been finished")]
    Finished,

    #[error("Rollback of transaction {id} failed: {reason}")]
    RollbackFailed {
        id: String,
        reason: String,
    },
}

/// Failures of the atomic unpacker.
#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("Unable to open transfer blob {path}")]
    OpenBlob {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Failures of the persistent update state.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Another update is already in progress (lock held on {path})")]
    AlreadyLocked {
        path: PathBuf,
    },

    #[error("Unable to lock {path}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unable to access update state {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Update state {path} holds an unknown value '{content}'")]
    Malformed {
        path: PathBuf,
        content: String,
    },
}

/// Failures of the previous-version backup.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("No previous version is available to restore")]
    NoBackup,

    #[error("Unable to read retained backup {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to restore the previous version after {attempts} attempts")]
    RestoreFailed {
        attempts: u32,
        #[source]
        source: TransactionError,
    },

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Failures while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read configuration file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration file {path}: {reason}")]
    Parse {
        path: PathBuf,
        reason: String,
    },

    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Attempt-scoped result of the update pipeline.
///
/// The orchestrators return this type; the CLI decides whether to surface it,
/// retry, or keep running the current version.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Transpile(#[from] TranspileError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error(transparent)]
    Unpack(#[from] UnpackError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unable to {operation} {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Unable to relaunch {path}")]
    Relaunch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Error wrapper carrying a user-facing suggestion and details.
#[derive(Debug)]
pub struct ErrorContext {
    /// Human readable description of what failed.
    pub message: String,
    /// What the user can do about it.
    pub suggestion: Option<String>,
    /// Additional background.
    pub details: Option<String>,
}

impl ErrorContext {
    /// Creates a context with only a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            suggestion: None,
            details: None,
        }
    }

    /// Adds a suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Adds details.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Prints the context to stderr with colors.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.message);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Converts any error into an [`ErrorContext`] with a suggestion.
///
/// Recognizes [`UpdateError`] and every per-stage error directly, so errors
/// propagated through `anyhow` without being wrapped still get tailored advice.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    let error = match error.downcast::<UpdateError>() {
        Ok(update) => return update_error_context(&update),
        Err(e) => e,
    };

    macro_rules! try_stage {
        ($error:ident, $($ty:ty),+) => {
            $(
                let $error = match $error.downcast::<$ty>() {
                    Ok(stage) => return update_error_context(&UpdateError::from(stage)),
                    Err(e) => e,
                };
            )+
        };
    }

    try_stage!(
        error,
        ResolveError,
        DownloadError,
        IntegrityError,
        TranspileError,
        HandoffError,
        UnpackError,
        TransactionError,
        StateError,
        BackupError,
        ConfigError
    );

    let mut ctx = ErrorContext::new(error.to_string());
    let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
    if !chain.is_empty() {
        ctx = ctx.with_details(chain.join(": "));
    }
    ctx
}

fn update_error_context(error: &UpdateError) -> ErrorContext {
    let mut ctx = ErrorContext::new(error.to_string());

    let source_chain = {
        let mut parts = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(inner) = source {
            let text = inner.to_string();
            if !parts.contains(&text) && text != ctx.message {
                parts.push(text);
            }
            source = inner.source();
        }
        parts
    };
    if !source_chain.is_empty() {
        ctx = ctx.with_details(source_chain.join(": "));
    }

    let suggestion = match error {
        UpdateError::Resolve(ResolveError::FetchFailed { .. })
        | UpdateError::Download(
            DownloadError::Transport { .. } | DownloadError::BadStatus { .. } | DownloadError::LengthMismatch { .. },
        ) => {
            "Check your internet connection; if GitHub rate limits you, put a token in the configured token file"
        }
        UpdateError::Resolve(_) => {
            "The release is missing required assets; wait for a fixed release or pass --url to pick another one"
        }
        UpdateError::Download(DownloadError::Aborted { .. }) => "The download was cancelled; run the update again",
        UpdateError::Integrity(_) => {
            "The downloaded archive is corrupted or was tampered with; run the update again to download a fresh copy"
        }
        UpdateError::Transpile(TranspileError::MissingLauncher { .. }) => {
            "The release archive does not contain the launcher; report this to the release maintainers"
        }
        UpdateError::Transpile(_) => "Check free disk space and permissions of the installation directory",
        UpdateError::Handoff(HandoffError::BadMessage { .. }) => {
            "The updater and the launcher come from different builds; reinstall the launcher manually"
        }
        UpdateError::Handoff(_) => "Run the update again; if it keeps failing, run `handover unpack --resume` manually",
        UpdateError::State(StateError::AlreadyLocked { .. }) => {
            "Terminate the other updater first; if none is running, rerun with --force"
        }
        UpdateError::Unpack(_) | UpdateError::Transaction(_) => {
            "No file was modified. Check permissions of the installation directory and run the update again"
        }
        UpdateError::Backup(BackupError::NoBackup) => "Only the version replaced by the last update can be restored",
        UpdateError::Config(_) => "Fix the configuration file or remove it to use the defaults",
        _ => "Check the log file for details",
    };

    ctx.with_suggestion(suggestion)
}
