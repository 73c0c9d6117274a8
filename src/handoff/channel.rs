//! Named duplex channel between the current process and its successor.
//!
//! A Unix domain socket at `<temp>/<name>.sock` on Unix and the named pipe
//! `\\.\pipe\<name>` on Windows. The owning side creates the channel with
//! [`ChannelListener::create`]; the successor connects with [`connect`].

use std::io;
use std::path::PathBuf;
use tracing::debug;

use crate::core::HandoffError;

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::net::{UnixListener, UnixStream};

    pub type ServerStream = UnixStream;
    pub type ClientStream = UnixStream;

    /// Filesystem path of the socket for `name`.
    pub fn channel_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{name}.sock"))
    }

    /// Owning end of the channel. Removes the socket file on drop.
    #[derive(Debug)]
    pub struct ChannelListener {
        name: String,
        path: PathBuf,
        listener: UnixListener,
    }

    impl ChannelListener {
        /// Creates the channel, replacing a stale socket file. Fails with
        /// [`HandoffError::ChannelBusy`] when a live process owns it.
        pub fn create(name: &str) -> Result<Self, HandoffError> {
            let path = channel_path(name);

            if path.exists() {
                if std::os::unix::net::UnixStream::connect(&path).is_ok() {
                    return Err(HandoffError::ChannelBusy {
                        name: name.to_string(),
                    });
                }
                debug!("Removing stale handoff socket {}", path.display());
                std::fs::remove_file(&path).map_err(|source| HandoffError::Channel {
                    operation: "create",
                    source,
                })?;
            }

            let listener = UnixListener::bind(&path).map_err(|source| {
                if source.kind() == io::ErrorKind::AddrInUse {
                    HandoffError::ChannelBusy {
                        name: name.to_string(),
                    }
                } else {
                    HandoffError::Channel {
                        operation: "create",
                        source,
                    }
                }
            })?;

            debug!("Created handoff channel {}", path.display());
            Ok(Self {
                name: name.to_string(),
                path,
                listener,
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        /// Waits for the successor to connect. Cancel safe.
        pub async fn accept(&mut self) -> io::Result<ServerStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(stream)
        }
    }

    impl Drop for ChannelListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    /// Connects to the channel named `name`.
    pub async fn connect(name: &str) -> io::Result<ClientStream> {
        UnixStream::connect(channel_path(name)).await
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    pub type ServerStream = NamedPipeServer;
    pub type ClientStream = NamedPipeClient;

    /// Pipe path for `name`.
    pub fn channel_path(name: &str) -> PathBuf {
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    }

    /// Owning end of the channel.
    #[derive(Debug)]
    pub struct ChannelListener {
        name: String,
        server: Option<NamedPipeServer>,
    }

    impl ChannelListener {
        /// Creates the pipe as its first instance. Fails with
        /// [`HandoffError::ChannelBusy`] when another process owns it.
        pub fn create(name: &str) -> Result<Self, HandoffError> {
            let server = ServerOptions::new()
                .first_pipe_instance(true)
                .create(channel_path(name))
                .map_err(|source| {
                    if source.kind() == io::ErrorKind::PermissionDenied {
                        HandoffError::ChannelBusy {
                            name: name.to_string(),
                        }
                    } else {
                        HandoffError::Channel {
                            operation: "create",
                            source,
                        }
                    }
                })?;

            debug!("Created handoff pipe {}", name);
            Ok(Self {
                name: name.to_string(),
                server: Some(server),
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        /// Waits for the successor to connect. Cancel safe.
        pub async fn accept(&mut self) -> io::Result<ServerStream> {
            let server = self.server.as_ref().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "pipe instance already handed out")
            })?;
            server.connect().await?;
            self.server
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "pipe instance vanished"))
        }
    }

    /// Connects to the pipe named `name`.
    pub async fn connect(name: &str) -> io::Result<ClientStream> {
        ClientOptions::new().open(channel_path(name))
    }
}

pub use imp::{ChannelListener, ClientStream, ServerStream, channel_path, connect};

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn unique(name: &str) -> String {
        format!("handover_test_{}_{}", name, uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn test_create_accept_connect() {
        let name = unique("basic");
        let mut listener = ChannelListener::create(&name).unwrap();

        let client = tokio::spawn({
            let name = name.clone();
            async move {
                let mut stream = connect(&name).await.unwrap();
                stream.write_all(b"ping").await.unwrap();
            }
        });

        let mut server = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_second_owner_is_busy() {
        let name = unique("busy");
        let _first = ChannelListener::create(&name).unwrap();
        assert!(matches!(
            ChannelListener::create(&name),
            Err(HandoffError::ChannelBusy { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let name = unique("stale");
        let path = channel_path(&name);
        {
            let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
            drop(std_listener);
        }
        assert!(path.exists());

        let listener = ChannelListener::create(&name).unwrap();
        assert_eq!(listener.name(), name);
        drop(listener);
        assert!(!path.exists());
    }
}
