//! Owned executor running one worker task per download.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{DownloadMonitor, NotificationKind, PendingDownload, SessionReporter};
use crate::core::DownloadError;
use crate::transport::{LengthCheck, ResponseBody, Transport, initial_capacity};

struct Worker {
    session: u32,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct ExecutorState {
    running: bool,
    workers: Vec<Worker>,
}

/// Explicitly owned executor for outbound requests.
///
/// Created running by [`RequestExecutor::start`]; [`RequestExecutor::stop`]
/// cancels outstanding sessions and joins their workers. Submitting after
/// `stop` fails with [`DownloadError::ExecutorStopped`].
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    next_session: AtomicU32,
    state: Mutex<ExecutorState>,
}

impl RequestExecutor {
    /// Starts an executor issuing requests through `transport`.
    pub fn start(transport: Arc<dyn Transport>) -> Self {
        debug!("Request executor started");
        Self {
            transport,
            next_session: AtomicU32::new(1),
            state: Mutex::new(ExecutorState {
                running: true,
                workers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether submissions are accepted.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Number of workers that have not finished yet.
    pub fn active_sessions(&self) -> usize {
        self.lock().workers.iter().filter(|w| !w.handle.is_finished()).count()
    }

    /// Downloads `url` into memory as UTF-8 text.
    pub fn download_string(
        &self,
        name: &str,
        url: &str,
        cancel: Arc<AtomicBool>,
    ) -> Result<PendingDownload<String>, DownloadError> {
        self.submit(name, url, cancel, None, |output, url| match output {
            Output::Bytes(bytes) => String::from_utf8(bytes).map_err(|e| DownloadError::Transport {
                url: url.to_string(),
                reason: format!("response is not valid UTF-8: {e}"),
            }),
            Output::File(_) => Err(DownloadError::Transport {
                url: url.to_string(),
                reason: "body was stored on disk instead of in memory".to_string(),
            }),
        })
    }

    /// Downloads `url` into `path`, resolving with the number of bytes written.
    ///
    /// Data is written to a sibling `.part` file and renamed into place once the
    /// body is complete; a failed or aborted download leaves nothing at `path`.
    pub fn download_file(
        &self,
        name: &str,
        url: &str,
        path: &Path,
        cancel: Arc<AtomicBool>,
    ) -> Result<PendingDownload<u64>, DownloadError> {
        self.submit(name, url, cancel, Some(path.to_path_buf()), |output, _| match output {
            Output::File(size) => Ok(size),
            Output::Bytes(bytes) => Ok(bytes.len() as u64),
        })
    }

    fn submit<T, F>(
        &self,
        name: &str,
        url: &str,
        cancel: Arc<AtomicBool>,
        path: Option<PathBuf>,
        convert: F,
    ) -> Result<PendingDownload<T>, DownloadError>
    where
        T: Send + 'static,
        F: FnOnce(Output, &str) -> Result<T, DownloadError> + Send + 'static,
    {
        let mut state = self.lock();
        if !state.running {
            return Err(DownloadError::ExecutorStopped);
        }
        state.workers.retain(|w| !w.handle.is_finished());

        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let monitor = Arc::new(DownloadMonitor::new());
        let reporter = SessionReporter::new(session, name, Arc::clone(&monitor));
        let (tx, rx) = oneshot::channel();

        let transport = Arc::clone(&self.transport);
        let worker_cancel = Arc::clone(&cancel);
        let url_owned = url.to_string();
        let handle = tokio::spawn(async move {
            let result = run_session(transport.as_ref(), &url_owned, &reporter, &worker_cancel, path)
                .await
                .and_then(|output| convert(output, &url_owned));
            // The receiver may have been dropped; the notifications are already pushed.
            let _ = tx.send(result);
        });

        debug!(session, name, url, "Download submitted");
        state.workers.push(Worker {
            session,
            cancel,
            handle,
        });

        Ok(PendingDownload::new(session, name.to_string(), monitor, rx))
    }

    /// Cancels every outstanding session and waits for the workers to exit.
    pub async fn stop(&self) {
        let workers = {
            let mut state = self.lock();
            state.running = false;
            std::mem::take(&mut state.workers)
        };

        for worker in &workers {
            worker.cancel.store(true, Ordering::SeqCst);
        }

        for worker in workers {
            if let Err(e) = worker.handle.await {
                warn!("Download worker for session {} failed: {}", worker.session, e);
            }
        }

        debug!("Request executor stopped");
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        let state = self.lock();
        for worker in &state.workers {
            worker.cancel.store(true, Ordering::SeqCst);
        }
    }
}

enum Output {
    Bytes(Vec<u8>),
    File(u64),
}

enum Destination {
    Memory(Vec<u8>),
    File {
        path: PathBuf,
        partial: PathBuf,
        file: tokio::fs::File,
        written: u64,
    },
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

impl Destination {
    async fn open(path: Option<PathBuf>, capacity: Option<u64>) -> Result<Self, DownloadError> {
        let Some(path) = path else {
            return Ok(Self::Memory(Vec::with_capacity(initial_capacity(capacity))));
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| DownloadError::Storage {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let partial = partial_path(&path);
        let file = tokio::fs::File::create(&partial).await.map_err(|source| {
            DownloadError::Storage {
                path: partial.clone(),
                source,
            }
        })?;

        Ok(Self::File {
            path,
            partial,
            file,
            written: 0,
        })
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        match self {
            Self::Memory(data) => {
                data.extend_from_slice(chunk);
                Ok(())
            }
            Self::File {
                partial,
                file,
                written,
                ..
            } => {
                file.write_all(chunk).await.map_err(|source| DownloadError::Storage {
                    path: partial.clone(),
                    source,
                })?;
                *written += chunk.len() as u64;
                Ok(())
            }
        }
    }

    async fn finish(self) -> Result<Output, DownloadError> {
        match self {
            Self::Memory(data) => Ok(Output::Bytes(data)),
            Self::File {
                path,
                partial,
                mut file,
                written,
            } => {
                let stored = async {
                    file.flush().await?;
                    file.sync_all().await?;
                    drop(file);
                    tokio::fs::rename(&partial, &path).await
                }
                .await;

                match stored {
                    Ok(()) => Ok(Output::File(written)),
                    Err(source) => {
                        let _ = tokio::fs::remove_file(&partial).await;
                        Err(DownloadError::Storage {
                            path,
                            source,
                        })
                    }
                }
            }
        }
    }

    async fn discard(self) {
        if let Self::File {
            partial,
            file,
            ..
        } = self
        {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                debug!("Could not remove partial download {}: {}", partial.display(), e);
            }
        }
    }
}

async fn stream_body(
    body: &mut dyn ResponseBody,
    destination: &mut Destination,
    reporter: &SessionReporter,
    cancel: &AtomicBool,
    url: &str,
) -> Result<(), DownloadError> {
    let mut check = LengthCheck::new(url, body.content_length());
    while let Some(chunk) = body.chunk().await? {
        if cancel.load(Ordering::SeqCst) {
            return Err(DownloadError::Aborted {
                url: url.to_string(),
            });
        }

        check.add(chunk.len())?;
        destination.write(&chunk).await?;
        reporter.push(NotificationKind::BytesReceived(chunk.len() as u64));
    }
    check.finish()?;
    Ok(())
}

async fn run_session(
    transport: &dyn Transport,
    url: &str,
    reporter: &SessionReporter,
    cancel: &AtomicBool,
    path: Option<PathBuf>,
) -> Result<Output, DownloadError> {
    let result = transfer(transport, url, reporter, cancel, path).await;
    if result.is_err() {
        reporter.push(NotificationKind::Aborted);
    }
    result
}

async fn transfer(
    transport: &dyn Transport,
    url: &str,
    reporter: &SessionReporter,
    cancel: &AtomicBool,
    path: Option<PathBuf>,
) -> Result<Output, DownloadError> {
    reporter.push(NotificationKind::SessionBegin {
        url: url.to_string(),
    });

    if cancel.load(Ordering::SeqCst) {
        return Err(DownloadError::Aborted {
            url: url.to_string(),
        });
    }

    let mut body = transport.open(url).await?;
    reporter.push(NotificationKind::SessionEstablished {
        url: url.to_string(),
    });

    let mut destination = Destination::open(path, body.content_length()).await?;
    reporter.push(NotificationKind::RequestStarted {
        url: url.to_string(),
    });

    if let Err(e) = stream_body(body.as_mut(), &mut destination, reporter, cancel, url).await {
        destination.discard().await;
        return Err(e);
    }
    reporter.push(NotificationKind::RequestCompleted {
        url: url.to_string(),
    });

    let output = destination.finish().await?;
    reporter.push(NotificationKind::Done {
        url: url.to_string(),
    });
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DownloadNotification, poll_until_complete, NullSink};
    use crate::test_utils::FakeTransport;
    use std::time::Duration;

    fn kinds(notifications: Vec<DownloadNotification>) -> Vec<NotificationKind> {
        notifications.into_iter().map(|n| n.kind).collect()
    }

    #[tokio::test]
    async fn test_download_string_full_notification_sequence() {
        let transport = Arc::new(FakeTransport::new());
        let url = "https://dl.test/hash.txt";
        transport.add_chunked(url, vec![vec![b'a'; 100], vec![b'b'; 924]]);

        let executor = RequestExecutor::start(transport);
        let pending =
            executor.download_string("hash", url, Arc::new(AtomicBool::new(false))).unwrap();
        let monitor = pending.monitor();

        let body = pending.await.unwrap();
        assert_eq!(body.len(), 1024);

        let u = url.to_string();
        assert_eq!(
            kinds(monitor.drain()),
            vec![
                NotificationKind::SessionBegin {
                    url: u.clone()
                },
                NotificationKind::SessionEstablished {
                    url: u.clone()
                },
                NotificationKind::RequestStarted {
                    url: u.clone()
                },
                NotificationKind::BytesReceived(100),
                NotificationKind::BytesReceived(924),
                NotificationKind::RequestCompleted {
                    url: u.clone()
                },
                NotificationKind::Done {
                    url: u
                },
            ]
        );
        executor.stop().await;
    }

    #[tokio::test]
    async fn test_download_file_writes_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("Launcher.zip");
        let transport = Arc::new(FakeTransport::new());
        transport.add_chunked("https://dl.test/z", vec![b"PK".to_vec(), b"data".to_vec()]);

        let executor = RequestExecutor::start(transport);
        let pending = executor
            .download_file("archive", "https://dl.test/z", &target, Arc::new(AtomicBool::new(false)))
            .unwrap();

        assert_eq!(pending.await.unwrap(), 6);
        assert_eq!(std::fs::read(&target).unwrap(), b"PKdata");
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_at_next_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Launcher.zip");
        let transport = Arc::new(FakeTransport::new());
        let chunks = (0..200).map(|_| vec![0u8; 16]).collect();
        transport.add_slow("https://dl.test/slow", chunks, Duration::from_millis(5));

        let cancel = Arc::new(AtomicBool::new(false));
        let executor = RequestExecutor::start(transport);
        let pending =
            executor.download_file("archive", "https://dl.test/slow", &target, Arc::clone(&cancel)).unwrap();
        let monitor = pending.monitor();

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.store(true, Ordering::SeqCst);

        assert!(matches!(pending.await, Err(DownloadError::Aborted { .. })));
        let seen = kinds(monitor.drain());
        assert_eq!(seen.last(), Some(&NotificationKind::Aborted));
        assert!(!seen.iter().any(|k| matches!(k, NotificationKind::Done { .. })));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn test_short_body_fails_and_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Launcher.zip");
        let transport = Arc::new(FakeTransport::new());
        transport.add_with_length("https://dl.test/short", vec![vec![0u8; 10]], 1 << 62);

        let executor = RequestExecutor::start(transport);
        let pending = executor
            .download_file("archive", "https://dl.test/short", &target, Arc::new(AtomicBool::new(false)))
            .unwrap();
        let monitor = pending.monitor();

        assert!(matches!(
            pending.await,
            Err(DownloadError::LengthMismatch {
                received: 10,
                ..
            })
        ));
        let seen = kinds(monitor.drain());
        assert_eq!(seen.last(), Some(&NotificationKind::Aborted));
        assert!(!seen.iter().any(|k| matches!(k, NotificationKind::RequestCompleted { .. })));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn test_long_body_fails_at_first_excess_chunk() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_with_length("https://dl.test/long", vec![vec![1u8; 4], vec![2u8; 4], vec![3u8; 4]], 6);

        let executor = RequestExecutor::start(transport);
        let pending = executor
            .download_string("hash", "https://dl.test/long", Arc::new(AtomicBool::new(false)))
            .unwrap();
        let monitor = pending.monitor();

        assert!(matches!(
            pending.await,
            Err(DownloadError::LengthMismatch {
                expected: 6,
                received: 8,
                ..
            })
        ));
        let received: Vec<_> = kinds(monitor.drain())
            .into_iter()
            .filter(|k| matches!(k, NotificationKind::BytesReceived(_)))
            .collect();
        assert_eq!(received, vec![NotificationKind::BytesReceived(4)]);
    }

    #[tokio::test]
    async fn test_bad_status_is_reported_as_aborted_session() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_status("https://dl.test/gone", 410);

        let executor = RequestExecutor::start(transport);
        let pending = executor
            .download_string("hash", "https://dl.test/gone", Arc::new(AtomicBool::new(false)))
            .unwrap();
        let monitor = pending.monitor();

        assert!(matches!(pending.await, Err(DownloadError::BadStatus { status: 410, .. })));
        assert_eq!(
            kinds(monitor.drain()),
            vec![
                NotificationKind::SessionBegin {
                    url: "https://dl.test/gone".to_string()
                },
                NotificationKind::Aborted,
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_sessions_have_unique_ids() {
        let transport = Arc::new(FakeTransport::new());
        transport.add("https://dl.test/a", b"a".to_vec());
        transport.add("https://dl.test/b", b"b".to_vec());

        let executor = RequestExecutor::start(transport);
        let cancel = Arc::new(AtomicBool::new(false));
        let a = executor.download_string("a", "https://dl.test/a", Arc::clone(&cancel)).unwrap();
        let b = executor.download_string("b", "https://dl.test/b", Arc::clone(&cancel)).unwrap();
        assert_ne!(a.session(), b.session());

        let monitors = [a.monitor(), b.monitor()];
        let (ra, rb) = poll_until_complete(
            futures::future::join(a, b),
            &monitors,
            &mut NullSink,
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(ra.unwrap(), "a");
        assert_eq!(rb.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_stop_cancels_and_rejects_new_submissions() {
        let transport = Arc::new(FakeTransport::new());
        let chunks = (0..1000).map(|_| vec![1u8; 8]).collect();
        transport.add_slow("https://dl.test/slow", chunks, Duration::from_millis(5));

        let executor = RequestExecutor::start(transport);
        let pending = executor
            .download_string("slow", "https://dl.test/slow", Arc::new(AtomicBool::new(false)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.stop().await;

        assert!(!executor.is_running());
        assert!(matches!(pending.await, Err(DownloadError::Aborted { .. })));
        assert!(matches!(
            executor.download_string("late", "https://dl.test/slow", Arc::new(AtomicBool::new(false))),
            Err(DownloadError::ExecutorStopped)
        ));
    }
}
