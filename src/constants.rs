//! Global constants used throughout the handover codebase.
//!
//! Timeouts, retry parameters, well-known file names and protocol literals
//! that more than one module depends on live here so the two processes of an
//! update always agree on them.

use std::time::Duration;

/// Name of the directory, inside the installation, holding updater bookkeeping
/// (lock/state file, staged blob, logs, transactions, retained backup).
pub const WORK_DIR_NAME: &str = ".handover";

/// File name of the lock/state record inside [`WORK_DIR_NAME`].
pub const LOCK_FILE_NAME: &str = "update.lock";

/// File name of the staged transfer blob inside [`WORK_DIR_NAME`].
pub const BLOB_FILE_NAME: &str = "launcher_update.bin";

/// Directory (inside [`WORK_DIR_NAME`]) where the transpiler extracts entries
/// for local inspection.
pub const EXTRACT_DIR_NAME: &str = "extracted";

/// Directory (inside [`WORK_DIR_NAME`]) holding filesystem transactions.
pub const TRANSACTIONS_DIR_NAME: &str = "transactions";

/// Directory (inside [`WORK_DIR_NAME`]) holding the previous version's files.
pub const PREVIOUS_DIR_NAME: &str = "previous";

/// Log file appended to by the successor process.
pub const UNPACKER_LOG_NAME: &str = "unpacker.log";

/// Base name of the copy of this executable that runs as the successor.
pub const SUCCESSOR_EXE_STEM: &str = "handover_unpacker";

/// Default well-known name of the handoff channel.
pub const DEFAULT_CHANNEL_NAME: &str = "handover_launcher_updater";

/// Default asset name of the published checksum.
pub const DEFAULT_CHECKSUM_ASSET: &str = "hash.txt";

/// Default asset name of the update archive.
pub const DEFAULT_ARCHIVE_ASSET: &str = "Launcher.zip";

/// Default launcher executable that must be present in every archive.
#[cfg(windows)]
pub const DEFAULT_LAUNCHER_EXE: &str = "Launcher.exe";

/// Default launcher executable that must be present in every archive.
#[cfg(not(windows))]
pub const DEFAULT_LAUNCHER_EXE: &str = "launcher";

/// Default release-list endpoint.
pub const DEFAULT_RELEASES_URL: &str = "https://api.github.com/repos/TeamREPENTOGON/Launcher/releases";

/// Value of the `User-Agent` header sent with every request.
pub const USER_AGENT: &str = concat!("handover/", env!("CARGO_PKG_VERSION"));

/// Grace period for a single handoff write on the current-process side (3 seconds).
pub const HANDOFF_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on each read or write performed by the successor (2 seconds).
pub const HANDOFF_IO_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for the successor to connect, per synchronization call (2 seconds).
pub const HANDOFF_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long the successor waits for the terminated process to disappear (5 seconds).
pub const TERMINATION_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep slice while the current process waits to be terminated (10 seconds).
pub const WAIT_FOR_DEATH_SLICE: Duration = Duration::from_secs(10);

/// Interval at which the download loop polls its completion future (10ms).
pub const DOWNLOAD_POLL_INTERVAL_MS: u64 = 10;

/// Minimum interval between two "bytes received" log lines of one session (100ms).
pub const PROGRESS_LOG_THROTTLE: Duration = Duration::from_millis(100);

/// Maximum backoff delay for exponential backoff (500ms).
pub const MAX_BACKOFF_DELAY_MS: u64 = 500;

/// Starting delay for exponential backoff (10ms).
pub const STARTING_BACKOFF_DELAY_MS: u64 = 10;

/// Number of times a restore of the previous version is attempted.
pub const RESTORE_ATTEMPTS: u32 = 3;

/// Number of times the successor tries to connect to the handoff channel.
pub const HANDOFF_CONNECT_ATTEMPTS: usize = 10;

/// Number of `Pending` handoff results the current process tolerates before
/// abandoning the update.
pub const HANDOFF_PENDING_RETRIES: u32 = 5;

/// How long `UpdateLock::acquire` retries before reporting the lock as held (2 seconds).
pub const STATE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration file looked up in the installation directory.
pub const CONFIG_FILE_NAME: &str = "handover.toml";

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "HANDOVER_CONFIG";

/// Number of times the current process restarts a failed handoff with a fresh
/// channel and successor.
pub const HANDOFF_ATTEMPTS: u32 = 2;

/// Upper bound on the buffer reserved up front from a `Content-Length` header (1 MiB).
pub const MAX_BODY_PREALLOCATION: u64 = 1 << 20;

/// How often waits that may last long check for an interrupt (100 ms).
pub const INTERRUPT_CHECK_INTERVAL: Duration = Duration::from_millis(100);
