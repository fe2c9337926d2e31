//! Typed events emitted by the engine to observers.
//!
//! The engine never renders anything itself; the terminal dashboard, the
//! browser bridge and any other consumer all observe the same channel. For
//! one run the stream is always a prefix of
//! `Started · Progress* · (Completed | Paused | Error)`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::constants::{PROGRESS_POLL_INTERVAL, SPEED_EMA_ALPHA};
use crate::progress::ProgressState;

/// Events emitted over the lifetime of downloads.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// Sent once per run, after the probe and before any payload bytes.
    Started {
        id: String,
        url: String,
        filename: String,
        total: u64,
        dest_path: PathBuf,
        state: Arc<ProgressState>,
    },
    /// Periodic progress sample from the polling reporter.
    Progress {
        id: String,
        downloaded: u64,
        total: u64,
        /// EMA-smoothed bytes per second.
        speed: f64,
        active_connections: u32,
    },
    /// The download was paused; remaining work has been persisted.
    Paused { id: String, downloaded: u64 },
    /// A paused download was re-submitted.
    Resumed { id: String },
    /// Terminal success.
    Completed {
        id: String,
        filename: String,
        elapsed: Duration,
        total: u64,
    },
    /// Terminal failure.
    Error { id: String, message: String },
    /// An external collaborator (e.g. the browser bridge) asks for a new
    /// download to be initiated.
    Request {
        id: String,
        url: String,
        filename: String,
        path: PathBuf,
    },
}

/// Sending half of the event bus.
pub type EventSender = mpsc::UnboundedSender<DownloadEvent>;
/// Receiving half of the event bus.
pub type EventReceiver = mpsc::UnboundedReceiver<DownloadEvent>;

/// Creates a new event bus pair.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Polls a [`ProgressState`] and emits [`DownloadEvent::Progress`] samples.
///
/// The engine only maintains counters; this reporter turns them into events
/// at a fixed cadence with EMA speed smoothing. Speed is computed from
/// session-local bytes so a resumed download does not spike.
pub struct ProgressReporter {
    state: Arc<ProgressState>,
    events: EventSender,
    poll_interval: Duration,
    last_speed: f64,
}

impl ProgressReporter {
    /// Creates a reporter for the given state, emitting on `events`.
    #[must_use]
    pub fn new(state: Arc<ProgressState>, events: EventSender) -> Self {
        Self {
            state,
            events,
            poll_interval: PROGRESS_POLL_INTERVAL,
            last_speed: 0.0,
        }
    }

    /// Runs until the download reaches a terminal state or every receiver
    /// is gone. Terminal events themselves are emitted by the manager and
    /// pool, never by the reporter.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if self.state.is_done() || self.state.is_paused() || self.state.error().is_some() {
                return;
            }

            let p = self.state.progress();
            let session_bytes = p.downloaded.saturating_sub(p.session_start_bytes);
            #[allow(clippy::cast_precision_loss)]
            let instant = if p.elapsed.as_secs_f64() > 0.0 && session_bytes > 0 {
                session_bytes as f64 / p.elapsed.as_secs_f64()
            } else {
                0.0
            };

            self.last_speed = if self.last_speed == 0.0 {
                instant
            } else {
                SPEED_EMA_ALPHA * instant + (1.0 - SPEED_EMA_ALPHA) * self.last_speed
            };

            let event = DownloadEvent::Progress {
                id: self.state.id().to_string(),
                downloaded: p.downloaded,
                total: p.total,
                speed: self.last_speed,
                active_connections: p.active_workers,
            };
            if self.events.send(event).is_err() {
                return;
            }
        }
    }
}
