//! Core types for handover
//!
//! This module holds the error taxonomy shared by every stage of the update
//! pipeline together with the user-facing [`ErrorContext`] used by the CLI.
//!
//! # Examples
//!
//! ```rust
//! use handover::core::{DownloadError, UpdateError, user_friendly_error};
//!
//! let error = UpdateError::from(DownloadError::ExecutorStopped);
//! let friendly = user_friendly_error(error.into());
//! assert!(friendly.message.contains("stopped"));
//! ```

pub mod error;

pub use error::{
    BackupError, BlobError, ConfigError, DownloadError, ErrorContext, HandoffError,
    IntegrityError, ResolveError, StateError, TransactionError, TranspileError, UnpackError,
    UpdateError, user_friendly_error,
};
