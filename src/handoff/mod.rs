//! Process handoff between the current process and its successor.
//!
//! The current process creates a named channel and spawns the successor. The
//! successor connects and the two exchange four fixed messages:
//!
//! ```text
//! successor                      current
//!     | ---- Updater-Hello ------->  |
//!     | <--- Launcher-Hello -------  |
//!     | ---- Updater-RequestPID -->  |
//!     | <--- Launcher-PID + pid ---  |
//! ```
//!
//! Afterwards the channel is torn down, the successor terminates the current
//! process and the current process sleeps until that happens.
//!
//! - [`Finalizer`] drives the current side as a resumable state machine.
//! - [`synchronize`] runs the successor side to completion.

pub mod channel;
pub mod finalizer;
pub mod messages;
pub mod synchronizer;

use std::time::Duration;

use crate::constants::{
    DEFAULT_CHANNEL_NAME, HANDOFF_CONNECT_ATTEMPTS, HANDOFF_CONNECT_TIMEOUT, HANDOFF_IO_TIMEOUT,
    HANDOFF_WRITE_TIMEOUT, TERMINATION_WAIT_TIMEOUT, WAIT_FOR_DEATH_SLICE,
};

pub use channel::{ChannelListener, channel_path};
pub use finalizer::{Finalizer, FinalizerProtocol};
pub use messages::HandoffMessage;
pub use synchronizer::{connect_with_retry, handshake, synchronize, terminate_process};

/// States of the current-process side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    AwaitingConnection,
    AwaitingHello,
    AwaitingPidRequest,
    Disconnecting,
    WaitingForTermination,
    /// An error occurred; the handoff cannot be resumed.
    Failed,
}

/// Non-error outcome of [`Finalizer::resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffStatus {
    /// A bounded wait elapsed; call `resume` again.
    Pending,
    /// The successor has the pid and will terminate this process.
    WaitingForTermination,
}

/// Timeouts and names shared by both sides of the handoff.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    pub channel_name: String,
    /// Wait for the successor to connect, per `resume` call.
    pub connect_timeout: Duration,
    /// Wait for an inbound message on the current side before reporting `Pending`.
    pub read_timeout: Duration,
    /// Bound on each write of the current side.
    pub write_timeout: Duration,
    /// Bound on each read and write of the successor.
    pub successor_io_timeout: Duration,
    pub connect_attempts: usize,
    /// How long the successor waits for the terminated process to exit.
    pub termination_timeout: Duration,
    pub death_slice: Duration,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            connect_timeout: HANDOFF_CONNECT_TIMEOUT,
            read_timeout: HANDOFF_IO_TIMEOUT,
            write_timeout: HANDOFF_WRITE_TIMEOUT,
            successor_io_timeout: HANDOFF_IO_TIMEOUT,
            connect_attempts: HANDOFF_CONNECT_ATTEMPTS,
            termination_timeout: TERMINATION_WAIT_TIMEOUT,
            death_slice: WAIT_FOR_DEATH_SLICE,
        }
    }
}

impl HandoffConfig {
    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }
}
