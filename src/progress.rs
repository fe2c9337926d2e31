//! Shared, thread-safe progress state for a single download.
//!
//! One `ProgressState` lives for the whole lifetime of a download and is
//! shared between the engine, the worker pool and observers. Counters and
//! flags are atomics; the session-timing fields are guarded together by one
//! small mutex so [`ProgressState::progress`] reads a consistent snapshot.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

/// Consistent snapshot returned by [`ProgressState::progress`].
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    /// Total bytes credited so far (monotonic).
    pub downloaded: u64,
    /// Total file size, or 0 when unknown.
    pub total: u64,
    /// Time since the current session started.
    pub elapsed: Duration,
    /// Workers currently holding a task.
    pub active_workers: u32,
    /// Value of `downloaded` when the current session started.
    pub session_start_bytes: u64,
}

#[derive(Debug)]
struct Timing {
    total_size: u64,
    start_time: Instant,
    session_start_bytes: u64,
    saved_elapsed: Duration,
}

/// Live state of one download, shared across workers and observers.
#[derive(Debug)]
pub struct ProgressState {
    id: String,
    downloaded: AtomicU64,
    active_workers: AtomicU32,
    done: AtomicBool,
    paused: AtomicBool,
    pausing: AtomicBool,
    error: Mutex<Option<String>>,
    cancel: Mutex<Option<CancellationToken>>,
    /// Unix nanos until which the host limiter has us blocked; 0 when clear.
    rate_limited_until: AtomicI64,
    timing: Mutex<Timing>,
}

impl ProgressState {
    /// Creates state for a download with unknown size.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            downloaded: AtomicU64::new(0),
            active_workers: AtomicU32::new(0),
            done: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pausing: AtomicBool::new(false),
            error: Mutex::new(None),
            cancel: Mutex::new(None),
            rate_limited_until: AtomicI64::new(0),
            timing: Mutex::new(Timing {
                total_size: 0,
                start_time: Instant::now(),
                session_start_bytes: 0,
                saved_elapsed: Duration::ZERO,
            }),
        }
    }

    /// The download's stable identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sets the total size, snapshots the session baseline and resets the
    /// session clock. Called once per run, after the probe.
    pub fn set_total_size(&self, size: u64) {
        let mut t = self.timing.lock().unwrap();
        t.total_size = size;
        t.session_start_bytes = self.downloaded.load(Ordering::Acquire);
        t.start_time = Instant::now();
    }

    /// Re-snapshots the session baseline. Called on resume so bytes from
    /// previous sessions are not attributed to the new session's speed.
    pub fn sync_session_start(&self) {
        let mut t = self.timing.lock().unwrap();
        t.session_start_bytes = self.downloaded.load(Ordering::Acquire);
        t.start_time = Instant::now();
    }

    /// Records elapsed time accumulated by previous sessions.
    pub fn set_saved_elapsed(&self, elapsed: Duration) {
        self.timing.lock().unwrap().saved_elapsed = elapsed;
    }

    /// Elapsed time carried over from previous sessions.
    #[must_use]
    pub fn saved_elapsed(&self) -> Duration {
        self.timing.lock().unwrap().saved_elapsed
    }

    /// Bytes credited so far.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    /// Credits `n` freshly written bytes. Only clamped contributions may be
    /// added here; the counter never decreases during a run.
    pub fn add_downloaded(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::AcqRel);
    }

    /// Overwrites the counter. Used when seeding from saved state (resume)
    /// or zeroing for a fresh run.
    pub fn store_downloaded(&self, n: u64) {
        self.downloaded.store(n, Ordering::Release);
    }

    /// Increments the active-worker gauge.
    pub fn worker_started(&self) {
        self.active_workers.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the active-worker gauge.
    pub fn worker_finished(&self) {
        self.active_workers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Consistent snapshot of counters and session timing.
    #[must_use]
    pub fn progress(&self) -> Progress {
        let downloaded = self.downloaded.load(Ordering::Acquire);
        let active_workers = self.active_workers.load(Ordering::Acquire);
        let t = self.timing.lock().unwrap();
        Progress {
            downloaded,
            total: t.total_size,
            elapsed: t.start_time.elapsed(),
            active_workers,
            session_start_bytes: t.session_start_bytes,
        }
    }

    /// Total size as set by the probe, 0 when unknown.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.timing.lock().unwrap().total_size
    }

    /// Stores the engine's cancellation handle for the current run.
    pub fn set_cancel_token(&self, token: CancellationToken) {
        *self.cancel.lock().unwrap() = Some(token);
    }

    /// Sets the paused flag and cancels the current run, if any. Idempotent;
    /// a pause with no run in flight only sets the flag.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        if let Some(token) = self.cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// Clears the paused flag. Idempotent.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// True while the paused flag is set.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Marks a pause as in flight, so a resume cannot race the teardown.
    pub fn set_pausing(&self, pausing: bool) {
        self.pausing.store(pausing, Ordering::Release);
    }

    /// True while a pause is still tearing down workers.
    #[must_use]
    pub fn is_pausing(&self) -> bool {
        self.pausing.load(Ordering::Acquire)
    }

    /// Marks the download as terminally finished.
    pub fn set_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// True once the download reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Records the first error observed; later calls are ignored so the
    /// original failure stays visible.
    pub fn set_error(&self, message: impl Into<String>) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(message.into());
        }
    }

    /// The first recorded error message, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    /// Publishes the instant until which the host limiter has this
    /// download's host blocked, for UI feedback.
    pub fn set_rate_limited_until(&self, until: SystemTime) {
        let nanos = until
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));
        self.rate_limited_until.store(nanos, Ordering::Release);
    }

    /// The published rate-limit deadline, if it is still in the future.
    #[must_use]
    pub fn rate_limited_until(&self) -> Option<SystemTime> {
        let nanos = self.rate_limited_until.load(Ordering::Acquire);
        if nanos <= 0 {
            return None;
        }
        let until = UNIX_EPOCH + Duration::from_nanos(nanos.unsigned_abs());
        (until > SystemTime::now()).then_some(until)
    }
}
