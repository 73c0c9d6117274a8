//! Asynchronous download engine.
//!
//! Downloads run on worker tasks owned by a [`RequestExecutor`]. Each
//! submission returns a [`PendingDownload`]: a completion future plus the
//! [`Monitor`] the worker pushes [`DownloadNotification`]s into. Callers poll
//! the future with a short timeout and drain the monitors between polls with
//! [`poll_until_complete`], so rendering never waits on the network.
//!
//! Within one session notifications are ordered
//! `SessionBegin → SessionEstablished → RequestStarted → BytesReceived* →
//! (RequestCompleted → Done | Aborted)`. A worker pushes every notification of
//! its session before completing the future, so a drain after the future
//! resolves observes all of them.
//!
//! Cancellation is cooperative: setting the shared flag makes the worker stop
//! at the next chunk boundary and report [`DownloadError::Aborted`].

mod executor;
mod progress;

pub use executor::RequestExecutor;
pub use progress::{IndicatifSink, NullSink, ProgressSink, TracingSink};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::core::DownloadError;
use crate::monitor::Monitor;

/// Event of one download session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    SessionBegin {
        url: String,
    },
    SessionEstablished {
        url: String,
    },
    RequestStarted {
        url: String,
    },
    BytesReceived(u64),
    RequestCompleted {
        url: String,
    },
    Aborted,
    Done {
        url: String,
    },
}

/// A notification tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadNotification {
    pub session: u32,
    pub name: String,
    pub kind: NotificationKind,
}

/// Queue of notifications for one session.
pub type DownloadMonitor = Monitor<DownloadNotification>;

/// Pushes notifications of one session into its monitor.
#[derive(Debug, Clone)]
pub struct SessionReporter {
    session: u32,
    name: String,
    monitor: Arc<DownloadMonitor>,
}

impl SessionReporter {
    pub fn new(session: u32, name: impl Into<String>, monitor: Arc<DownloadMonitor>) -> Self {
        Self {
            session,
            name: name.into(),
            monitor,
        }
    }

    pub fn push(&self, kind: NotificationKind) {
        self.monitor.push(DownloadNotification {
            session: self.session,
            name: self.name.clone(),
            kind,
        });
    }
}

/// Completion future of a submitted download.
///
/// Resolves with the body (for string downloads) or the number of bytes
/// written (for file downloads).
#[derive(Debug)]
pub struct PendingDownload<T> {
    session: u32,
    name: String,
    monitor: Arc<DownloadMonitor>,
    result: oneshot::Receiver<Result<T, DownloadError>>,
}

impl<T> PendingDownload<T> {
    pub(crate) fn new(
        session: u32,
        name: String,
        monitor: Arc<DownloadMonitor>,
        result: oneshot::Receiver<Result<T, DownloadError>>,
    ) -> Self {
        Self {
            session,
            name,
            monitor,
            result,
        }
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The monitor this session reports into.
    pub fn monitor(&self) -> Arc<DownloadMonitor> {
        Arc::clone(&self.monitor)
    }
}

impl<T> Unpin for PendingDownload<T> {}

impl<T> Future for PendingDownload<T> {
    type Output = Result<T, DownloadError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.result).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DownloadError::WorkerLost {
                name: this.name.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Polls `future` with `interval` timeouts, draining every monitor into `sink`
/// on each iteration and once more after the future resolves.
pub async fn poll_until_complete<F>(
    mut future: F,
    monitors: &[Arc<DownloadMonitor>],
    sink: &mut dyn ProgressSink,
    interval: Duration,
) -> F::Output
where
    F: Future + Unpin,
{
    loop {
        let outcome = tokio::time::timeout(interval, &mut future).await;

        for monitor in monitors {
            for notification in monitor.drain() {
                sink.notify(&notification);
            }
        }

        if let Ok(output) = outcome {
            sink.finish();
            return output;
        }
    }
}
