//! Rendering of download notifications.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{DownloadNotification, NotificationKind};
use crate::constants::PROGRESS_LOG_THROTTLE;

/// Consumer of drained download notifications.
pub trait ProgressSink: Send {
    fn notify(&mut self, notification: &DownloadNotification);

    /// Called once after the last drain.
    fn finish(&mut self) {}
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn notify(&mut self, _notification: &DownloadNotification) {}
}

#[derive(Debug, Default)]
struct SessionProgress {
    total: u64,
    last_logged: Option<Instant>,
}

/// Logs notifications through `tracing`, at most one byte-count line per
/// session every `throttle`.
#[derive(Debug)]
pub struct TracingSink {
    throttle: Duration,
    sessions: HashMap<u32, SessionProgress>,
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(PROGRESS_LOG_THROTTLE)
    }
}

impl TracingSink {
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            sessions: HashMap::new(),
        }
    }

    /// Bytes received so far by `session`.
    pub fn received(&self, session: u32) -> u64 {
        self.sessions.get(&session).map_or(0, |s| s.total)
    }
}

impl ProgressSink for TracingSink {
    fn notify(&mut self, n: &DownloadNotification) {
        match &n.kind {
            NotificationKind::SessionBegin {
                url,
            } => debug!(session = n.session, "[{}] Initializing download of {}", n.name, url),
            NotificationKind::SessionEstablished {
                url,
            } => debug!(session = n.session, "[{}] Connected to {}", n.name, url),
            NotificationKind::RequestStarted {
                url,
            } => info!(session = n.session, "[{}] Downloading {}", n.name, url),
            NotificationKind::BytesReceived(bytes) => {
                let throttle = self.throttle;
                let progress = self.sessions.entry(n.session).or_default();
                progress.total += bytes;

                let due = progress.last_logged.is_none_or(|last| last.elapsed() >= throttle);
                if due {
                    progress.last_logged = Some(Instant::now());
                    debug!(session = n.session, "[{}] Received {} bytes", n.name, progress.total);
                }
            }
            NotificationKind::RequestCompleted {
                url,
            } => debug!(session = n.session, "[{}] Transfer of {} complete", n.name, url),
            NotificationKind::Aborted => {
                warn!(session = n.session, "[{}] Download aborted", n.name);
            }
            NotificationKind::Done {
                url,
            } => info!(
                session = n.session,
                "[{}] Downloaded {} ({} bytes)",
                n.name,
                url,
                self.received(n.session)
            ),
        }
    }
}

/// Renders one spinner per session with indicatif.
pub struct IndicatifSink {
    multi: MultiProgress,
    bars: HashMap<u32, ProgressBar>,
}

impl Default for IndicatifSink {
    fn default() -> Self {
        Self::new()
    }
}

fn download_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:.bold.cyan} {spinner:.cyan} {msg} {bytes} ({bytes_per_sec})")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
}

impl IndicatifSink {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar(&mut self, n: &DownloadNotification) -> &ProgressBar {
        let multi = &self.multi;
        self.bars.entry(n.session).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(download_style());
            bar.set_prefix(n.name.clone());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        })
    }
}

impl ProgressSink for IndicatifSink {
    fn notify(&mut self, n: &DownloadNotification) {
        match &n.kind {
            NotificationKind::SessionBegin {
                ..
            } => self.bar(n).set_message("connecting"),
            NotificationKind::SessionEstablished {
                ..
            }
            | NotificationKind::RequestStarted {
                ..
            } => self.bar(n).set_message("downloading"),
            NotificationKind::BytesReceived(bytes) => self.bar(n).inc(*bytes),
            NotificationKind::RequestCompleted {
                ..
            } => self.bar(n).set_message("finishing"),
            NotificationKind::Aborted => self.bar(n).abandon_with_message("aborted"),
            NotificationKind::Done {
                ..
            } => self.bar(n).finish_with_message("done"),
        }
    }

    fn finish(&mut self) {
        for bar in self.bars.values() {
            if !bar.is_finished() {
                bar.finish_and_clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(session: u32, n: u64) -> DownloadNotification {
        DownloadNotification {
            session,
            name: "archive".to_string(),
            kind: NotificationKind::BytesReceived(n),
        }
    }

    #[test]
    fn test_tracing_sink_accumulates_per_session() {
        let mut sink = TracingSink::new(Duration::from_secs(60));
        sink.notify(&bytes(1, 100));
        sink.notify(&bytes(1, 924));
        sink.notify(&bytes(2, 5));

        assert_eq!(sink.received(1), 1024);
        assert_eq!(sink.received(2), 5);
        assert_eq!(sink.received(3), 0);
    }

    #[test]
    fn test_tracing_sink_throttles_log_lines() {
        let mut sink = TracingSink::new(Duration::from_secs(60));
        sink.notify(&bytes(1, 1));
        let first = sink.sessions[&1].last_logged.unwrap();
        sink.notify(&bytes(1, 1));
        assert_eq!(sink.sessions[&1].last_logged.unwrap(), first);
    }

    #[test]
    fn test_indicatif_sink_tracks_sessions() {
        let mut sink = IndicatifSink::new();
        sink.multi.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        sink.notify(&bytes(4, 10));
        sink.notify(&DownloadNotification {
            session: 4,
            name: "archive".to_string(),
            kind: NotificationKind::Done {
                url: "u".to_string(),
            },
        });
        assert_eq!(sink.bars[&4].position(), 10);
        assert!(sink.bars[&4].is_finished());
        sink.finish();
    }
}
