//! Fixed messages of the handoff protocol and their framing.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::core::HandoffError;

/// Length of the process id following [`HandoffMessage::AnswerPid`].
pub const PID_LEN: usize = 4;

/// One of the four protocol messages, in exchange order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffMessage {
    /// Successor → current.
    Hello,
    /// Current → successor.
    HelloAck,
    /// Successor → current.
    RequestPid,
    /// Current → successor, followed by the 4-byte little-endian pid.
    AnswerPid,
}

impl HandoffMessage {
    /// The literal bytes sent on the wire.
    pub const fn literal(self) -> &'static str {
        match self {
            Self::Hello => "Updater-Hello",
            Self::HelloAck => "Launcher-Hello",
            Self::RequestPid => "Updater-RequestPID",
            Self::AnswerPid => "Launcher-PID",
        }
    }

    pub const fn bytes(self) -> &'static [u8] {
        self.literal().as_bytes()
    }
}

/// Checks a complete inbound message against the expected literal.
pub fn validate(expected: HandoffMessage, received: &[u8]) -> Result<(), HandoffError> {
    if received == expected.bytes() {
        Ok(())
    } else {
        Err(bad_message(expected, received))
    }
}

fn bad_message(expected: HandoffMessage, received: &[u8]) -> HandoffError {
    HandoffError::BadMessage {
        expected: expected.literal(),
        received: String::from_utf8_lossy(received).into_owned(),
    }
}

/// `AnswerPid` literal followed by the pid.
pub fn encode_answer(pid: u32) -> Vec<u8> {
    let mut bytes = HandoffMessage::AnswerPid.bytes().to_vec();
    bytes.extend_from_slice(&pid.to_le_bytes());
    bytes
}

/// Reads `expected` into `inbound`, waiting at most `timeout`.
///
/// Returns `Ok(false)` when the wait elapsed before the message was complete;
/// the bytes received so far stay in `inbound`, so calling again continues the
/// same message. A byte that diverges from the literal fails immediately.
pub async fn read_message<S>(
    stream: &mut S,
    inbound: &mut Vec<u8>,
    expected: HandoffMessage,
    timeout: Duration,
) -> Result<bool, HandoffError>
where
    S: AsyncRead + Unpin,
{
    let literal = expected.bytes();
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 64];

    while inbound.len() < literal.len() {
        let want = (literal.len() - inbound.len()).min(buf.len());
        match tokio::time::timeout_at(deadline, stream.read(&mut buf[..want])).await {
            Err(_) => return Ok(false),
            Ok(Err(source)) => {
                return Err(HandoffError::Channel {
                    operation: "read",
                    source,
                });
            }
            Ok(Ok(0)) if inbound.is_empty() => {
                return Err(HandoffError::PeerClosed {
                    expected: expected.literal(),
                });
            }
            Ok(Ok(0)) => return Err(bad_message(expected, inbound.as_slice())),
            Ok(Ok(n)) => {
                inbound.extend_from_slice(&buf[..n]);
                if !literal.starts_with(inbound.as_slice()) {
                    return Err(bad_message(expected, inbound.as_slice()));
                }
            }
        }
    }

    let result = validate(expected, inbound.as_slice());
    inbound.clear();
    result.map(|()| true)
}

/// Reads the 4-byte pid following `AnswerPid`.
pub async fn read_pid<S>(stream: &mut S, timeout: Duration) -> Result<u32, HandoffError>
where
    S: AsyncRead + Unpin,
{
    let mut pid = [0u8; PID_LEN];
    match tokio::time::timeout(timeout, stream.read_exact(&mut pid)).await {
        Err(_) => Err(HandoffError::ReadTimeout {
            expected: "process id",
        }),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(HandoffError::PeerClosed {
            expected: "process id",
        }),
        Ok(Err(source)) => Err(HandoffError::Channel {
            operation: "read",
            source,
        }),
        Ok(Ok(_)) => Ok(u32::from_le_bytes(pid)),
    }
}

/// Writes `bytes` completely, waiting at most `timeout`.
pub async fn write_message<S>(
    stream: &mut S,
    message: HandoffMessage,
    bytes: &[u8],
    timeout: Duration,
) -> Result<(), HandoffError>
where
    S: AsyncWrite + Unpin,
{
    let write = async {
        stream.write_all(bytes).await?;
        stream.flush().await
    };

    match tokio::time::timeout(timeout, write).await {
        Err(_) => Err(HandoffError::WriteTimeout {
            message: message.literal(),
        }),
        Ok(Err(source)) => Err(HandoffError::Channel {
            operation: "write",
            source,
        }),
        Ok(Ok(())) => Ok(()),
    }
}
