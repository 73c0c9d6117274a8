//! Current-process side of the handoff.
//!
//! The [`Finalizer`] owns the channel and the successor's process handle. Each
//! call to [`Finalizer::resume`] advances the state machine as far as it can
//! within the configured bounded waits and returns [`HandoffStatus::Pending`]
//! when the successor has not connected or spoken yet, so the caller can
//! retry without restarting the pipeline.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::channel::{ChannelListener, ServerStream};
use super::messages::{HandoffMessage, encode_answer, read_message, write_message};
use super::{HandoffConfig, HandoffState, HandoffStatus};
use crate::constants::INTERRUPT_CHECK_INTERVAL;
use crate::core::HandoffError;

/// Message exchange of the current process, independent of the transport.
#[derive(Debug)]
pub struct FinalizerProtocol {
    state: HandoffState,
    inbound: Vec<u8>,
    pid: u32,
}

impl FinalizerProtocol {
    /// Starts in [`HandoffState::AwaitingHello`]; `pid` is what the successor
    /// will be told to terminate.
    pub fn new(pid: u32) -> Self {
        Self {
            state: HandoffState::AwaitingHello,
            inbound: Vec::new(),
            pid,
        }
    }

    pub fn state(&self) -> HandoffState {
        self.state
    }

    /// Processes inbound messages until the exchange completes or a read
    /// does not finish within `config.read_timeout`.
    ///
    /// Any error leaves the protocol in [`HandoffState::Failed`].
    pub async fn advance<S>(
        &mut self,
        stream: &mut S,
        config: &HandoffConfig,
    ) -> Result<HandoffStatus, HandoffError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.step_all(stream, config).await;
        if result.is_err() {
            self.state = HandoffState::Failed;
        }
        result
    }

    async fn step_all<S>(
        &mut self,
        stream: &mut S,
        config: &HandoffConfig,
    ) -> Result<HandoffStatus, HandoffError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match self.state {
                HandoffState::AwaitingHello => {
                    debug!("Waiting for hello from successor");
                    if !read_message(stream, &mut self.inbound, HandoffMessage::Hello, config.read_timeout)
                        .await?
                    {
                        return Ok(HandoffStatus::Pending);
                    }
                    write_message(
                        stream,
                        HandoffMessage::HelloAck,
                        HandoffMessage::HelloAck.bytes(),
                        config.write_timeout,
                    )
                    .await?;
                    self.state = HandoffState::AwaitingPidRequest;
                }
                HandoffState::AwaitingPidRequest => {
                    debug!("Waiting for pid request from successor");
                    if !read_message(
                        stream,
                        &mut self.inbound,
                        HandoffMessage::RequestPid,
                        config.read_timeout,
                    )
                    .await?
                    {
                        return Ok(HandoffStatus::Pending);
                    }
                    info!("Sending pid {} to successor", self.pid);
                    write_message(
                        stream,
                        HandoffMessage::AnswerPid,
                        &encode_answer(self.pid),
                        config.write_timeout,
                    )
                    .await?;
                    self.state = HandoffState::Disconnecting;
                }
                HandoffState::Disconnecting | HandoffState::WaitingForTermination => {
                    return Ok(HandoffStatus::WaitingForTermination);
                }
                HandoffState::AwaitingConnection | HandoffState::Failed => {
                    return Err(HandoffError::InvalidResume {
                        reason: "protocol is not connected",
                    });
                }
            }
        }
    }
}

/// Current-process handoff driver.
pub struct Finalizer {
    config: HandoffConfig,
    listener: Option<ChannelListener>,
    stream: Option<ServerStream>,
    successor: Option<Child>,
    protocol: FinalizerProtocol,
    connected: bool,
}

impl Finalizer {
    /// Wraps an already created channel. `successor` is the spawned successor
    /// process, when this process spawned it.
    pub fn new(listener: ChannelListener, successor: Option<Child>, config: HandoffConfig) -> Self {
        Self {
            config,
            listener: Some(listener),
            stream: None,
            successor,
            protocol: FinalizerProtocol::new(std::process::id()),
            connected: false,
        }
    }

    /// Creates the channel named in `config`, then spawns the successor with
    /// `command`.
    pub fn start(config: HandoffConfig, mut command: Command) -> Result<Self, HandoffError> {
        let listener = ChannelListener::create(&config.channel_name)?;
        let program = PathBuf::from(command.as_std().get_program());

        info!("Starting successor {}", program.display());
        let child = command.spawn().map_err(|source| HandoffError::SpawnSuccessor {
            path: program,
            source,
        })?;
        debug!(pid = ?child.id(), "Successor started");

        Ok(Self::new(listener, Some(child), config))
    }

    /// Overrides the pid sent to the successor.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.protocol.pid = pid;
        self
    }

    pub fn state(&self) -> HandoffState {
        if self.connected { self.protocol.state() } else { HandoffState::AwaitingConnection }
    }

    /// Advances the handoff as far as possible.
    ///
    /// Returns [`HandoffStatus::Pending`] when a bounded wait elapsed, and
    /// [`HandoffStatus::WaitingForTermination`] once the successor has the pid
    /// and the channel has been torn down.
    pub async fn resume(&mut self) -> Result<HandoffStatus, HandoffError> {
        if self.protocol.state() == HandoffState::Failed {
            return Err(HandoffError::InvalidResume {
                reason: "a previous attempt failed",
            });
        }

        if let Some(status) = self.check_successor()? {
            return Ok(status);
        }

        if !self.connected {
            let Some(listener) = self.listener.as_mut() else {
                return Err(HandoffError::InvalidResume {
                    reason: "channel has been closed",
                });
            };

            match tokio::time::timeout(self.config.connect_timeout, listener.accept()).await {
                Err(_) => {
                    info!("Timed out waiting for the successor to connect");
                    return Ok(HandoffStatus::Pending);
                }
                Ok(Err(source)) => {
                    self.protocol.state = HandoffState::Failed;
                    return Err(HandoffError::Channel {
                        operation: "accept",
                        source,
                    });
                }
                Ok(Ok(stream)) => {
                    info!("Successor connected");
                    self.stream = Some(stream);
                    self.connected = true;
                }
            }
        }

        if self.protocol.state() == HandoffState::WaitingForTermination {
            return Ok(HandoffStatus::WaitingForTermination);
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(HandoffError::InvalidResume {
                reason: "channel has been closed",
            });
        };

        let status = self.protocol.advance(stream, &self.config).await?;
        if status == HandoffStatus::WaitingForTermination {
            debug!("Tearing down handoff channel");
            self.stream = None;
            self.listener = None;
            self.protocol.state = HandoffState::WaitingForTermination;
        }
        Ok(status)
    }

    fn check_successor(&mut self) -> Result<Option<HandoffStatus>, HandoffError> {
        let Some(child) = self.successor.as_mut() else {
            return Ok(None);
        };

        match child.try_wait() {
            Ok(Some(status)) if self.protocol.state() != HandoffState::WaitingForTermination => {
                self.protocol.state = HandoffState::Failed;
                Err(successor_exited(status))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("Unable to query successor status: {}", e);
                Ok(None)
            }
        }
    }

    /// Sleeps until the successor terminates this process.
    ///
    /// Only returns when the successor exits without doing so, in which case
    /// the update is abandoned and the current version keeps running.
    pub async fn wait_for_termination(&mut self, interrupt: &AtomicBool) -> HandoffError {
        let slice = INTERRUPT_CHECK_INTERVAL.min(self.config.death_slice);
        let mut waited = Duration::ZERO;
        loop {
            if interrupt.load(Ordering::SeqCst) {
                warn!("Interrupted while waiting for the successor");
                return HandoffError::Interrupted;
            }

            if let Some(child) = self.successor.as_mut() {
                match tokio::time::timeout(slice, child.wait()).await {
                    Ok(Ok(status)) => return successor_exited(status),
                    Ok(Err(source)) => {
                        return HandoffError::Channel {
                            operation: "wait for successor",
                            source,
                        };
                    }
                    Err(_) => {}
                }
            } else {
                tokio::time::sleep(slice).await;
            }

            waited += slice;
            if waited >= self.config.death_slice {
                warn!("Still alive after handing off to the successor");
                waited = Duration::ZERO;
            }
        }
    }
}

fn successor_exited(status: ExitStatus) -> HandoffError {
    HandoffError::SuccessorExited {
        status: status.to_string(),
    }
}
