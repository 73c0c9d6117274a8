//! Successor side of the handoff.
//!
//! The successor connects to the channel created by the current process,
//! learns its pid through the fixed message exchange and terminates it so the
//! installation files are no longer in use.

use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, info, warn};

use super::HandoffConfig;
use super::channel::{ClientStream, connect};
use super::messages::{HandoffMessage, read_message, read_pid, write_message};
use crate::constants::{MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS};
use crate::core::HandoffError;

/// Connects to the named channel, retrying with exponential backoff up to
/// `config.connect_attempts` times.
pub async fn connect_with_retry(config: &HandoffConfig) -> Result<ClientStream, HandoffError> {
    let backoff = ExponentialBackoff::from_millis(STARTING_BACKOFF_DELAY_MS)
        .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS))
        .take(config.connect_attempts.saturating_sub(1));

    let mut delays = backoff.into_iter();
    let mut attempt = 1;
    loop {
        match tokio::time::timeout(config.connect_timeout, connect(&config.channel_name)).await {
            Ok(Ok(stream)) => {
                debug!(attempt, "Connected to handoff channel '{}'", config.channel_name);
                return Ok(stream);
            }
            Ok(Err(e)) => debug!(attempt, "Handoff channel not available yet: {}", e),
            Err(_) => debug!(attempt, "Connecting to handoff channel timed out"),
        }

        let Some(delay) = delays.next() else {
            return Err(HandoffError::ConnectTimeout {
                name: config.channel_name.clone(),
            });
        };
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Runs the successor's message exchange and returns the current process id.
///
/// Every read must complete within `io_timeout`; a read that does not is a
/// [`HandoffError::ReadTimeout`].
pub async fn handshake<S>(stream: &mut S, config: &HandoffConfig) -> Result<u32, HandoffError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io_timeout = config.successor_io_timeout;

    write_message(stream, HandoffMessage::Hello, HandoffMessage::Hello.bytes(), io_timeout).await?;
    expect(stream, HandoffMessage::HelloAck, io_timeout).await?;

    write_message(
        stream,
        HandoffMessage::RequestPid,
        HandoffMessage::RequestPid.bytes(),
        io_timeout,
    )
    .await?;
    expect(stream, HandoffMessage::AnswerPid, io_timeout).await?;

    let pid = read_pid(stream, io_timeout).await?;
    info!("Current process id is {}", pid);
    Ok(pid)
}

async fn expect<S>(stream: &mut S, message: HandoffMessage, timeout: Duration) -> Result<(), HandoffError>
where
    S: AsyncRead + Unpin,
{
    let mut inbound = Vec::new();
    if read_message(stream, &mut inbound, message, timeout).await? {
        Ok(())
    } else {
        Err(HandoffError::ReadTimeout {
            expected: message.literal(),
        })
    }
}

/// Connects, performs the handshake and terminates the current process.
///
/// Returns the pid that was terminated.
pub async fn synchronize(config: &HandoffConfig) -> Result<u32, HandoffError> {
    let mut stream = connect_with_retry(config).await?;
    let pid = handshake(&mut stream, config).await?;
    drop(stream);

    terminate_process(pid, config.termination_timeout).await?;
    Ok(pid)
}

/// Kills `pid` and waits up to `wait` for it to disappear.
///
/// A process that is already gone counts as terminated.
pub async fn terminate_process(pid: u32, wait: Duration) -> Result<(), HandoffError> {
    tokio::task::spawn_blocking(move || terminate_blocking(pid, wait))
        .await
        .map_err(|_| HandoffError::Terminate { pid })?
}

fn terminate_blocking(pid: u32, wait: Duration) -> Result<(), HandoffError> {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);

    let Some(process) = system.process(target) else {
        debug!("Process {} is not running", pid);
        return Ok(());
    };

    info!("Terminating process {}", pid);
    if !process.kill() {
        warn!("Kill signal to process {} was not delivered", pid);
        return Err(HandoffError::Terminate { pid });
    }

    let start = Instant::now();
    loop {
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        match system.process(target) {
            None => break,
            Some(p) if p.status() == ProcessStatus::Zombie => break,
            Some(_) => {}
        }
        if start.elapsed() >= wait {
            return Err(HandoffError::WaitProcess { pid });
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    debug!(wait_ms = start.elapsed().as_millis(), "Process {} exited", pid);
    Ok(())
}
