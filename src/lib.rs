//! handover - two-process self-update for a launcher installation
//!
//! A running program cannot overwrite its own files safely, so the update is
//! split across two processes. The running launcher (the *current process*)
//! does everything that is safe while it keeps running; a staged copy of the
//! updater (the *successor*) terminates it and swaps the new files in.
//!
//! # Architecture Overview
//!
//! ```text
//! current process                                   successor
//! ───────────────                                   ─────────
//! lock, recover
//! resolve release ──► download checksum + archive
//! verify SHA-256 ──► transpile zip into blob
//! stage successor, release lock
//! create channel, spawn successor ───────────────► lock
//!                 ◄── Updater-Hello                 connect (retry)
//! Launcher-Hello  ──►
//!                 ◄── Updater-RequestPID
//! Launcher-PID+pid ─►                               terminate pid
//! (terminated)                                      recover, unpack (one transaction)
//!                                                   retain previous version
//!                                                   clear state, relaunch launcher
//! ```
//!
//! Every step that mutates the installation goes through an
//! [`transaction::FsTransaction`]: the tree is either fully updated or left
//! exactly as it was. Progress is recorded in `.handover/update.lock`, so an
//! interrupted run resumes from the staged blob instead of downloading again.
//!
//! # Modules
//!
//! ## Pipeline
//! - [`pipeline`] - current-process orchestrator
//! - [`successor`] - successor orchestrator
//! - [`release`] - release selection against the release API
//! - [`download`] - worker-per-request download engine with progress monitors
//! - [`verification`] - SHA-256 archive verification
//! - [`transpile`] - zip archive to transfer blob conversion
//! - [`handoff`] - the message protocol between the two processes
//! - [`unpack`] - atomic application of a blob
//!
//! ## Persistence
//! - [`transaction`] - journaled filesystem transactions and crash recovery
//! - [`backup`] - the single retained previous version
//! - [`state`] - the update lock and its recorded state
//! - [`blob`] - transfer blob codec (legacy and tagged layouts)
//!
//! ## Supporting Modules
//! - [`cli`] - command-line interface
//! - [`config`] - `handover.toml` loading and validation
//! - [`core`] - error taxonomy and user-facing error contexts
//! - [`layout`] - well-known paths of an installation
//! - [`monitor`] - mutex-guarded queue with timed waits
//! - [`transport`] - HTTP transport seam
//! - [`utils`] - filesystem helpers
//!
//! # Command-Line Usage
//!
//! ```bash
//! # Is there anything newer?
//! handover check
//!
//! # Stage the latest release and hand over to the successor
//! handover update
//!
//! # Undo the last update
//! handover rollback
//! ```

// Pipeline
pub mod download;
pub mod handoff;
pub mod pipeline;
pub mod release;
pub mod successor;
pub mod transpile;
pub mod unpack;
pub mod verification;

// Persistence
pub mod backup;
pub mod blob;
pub mod state;
pub mod transaction;

// Supporting modules
pub mod cli;
pub mod config;
pub mod constants;
pub mod core;
pub mod layout;
pub mod monitor;
pub mod transport;
pub mod utils;

// test_utils module is available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
