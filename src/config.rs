//! Configuration types: the tuned runtime knobs and the per-download
//! request submitted to the pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    ALIGN_SIZE, DEFAULT_USER_AGENT, MAX_CHUNK, MAX_TASK_RETRIES, MIN_CHUNK, PER_HOST_LIMIT,
    PER_HOST_MAX, SLOW_WORKER_GRACE, SLOW_WORKER_THRESHOLD, SPEED_EMA_ALPHA, STALL_TIMEOUT,
    TARGET_CHUNK, WORKER_BUFFER,
};
use crate::events::EventSender;
use crate::progress::ProgressState;

/// Tuned engine knobs. Immutable for the duration of a download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Concurrent connections allowed to a single host.
    pub max_connections_per_host: usize,
    /// User-Agent header sent on every request.
    pub user_agent: String,
    /// Smallest task the chunker or balancer may produce.
    pub min_chunk_size: u64,
    /// Largest task the initial chunker may produce.
    pub max_chunk_size: u64,
    /// Preferred chunk size when the file size gives no better answer.
    pub target_chunk_size: u64,
    /// Per-worker read/write buffer size.
    pub worker_buffer_size: usize,
    /// Attempts per task before it is handed back to the queue.
    pub max_task_retries: u32,
    /// Fraction of the live mean speed below which a worker is slow.
    pub slow_worker_threshold: f64,
    /// Minimum age of a task attempt before it may be health-cancelled.
    pub slow_worker_grace_period: Duration,
    /// No progress for this long marks a worker as stalled.
    pub stall_timeout: Duration,
    /// EMA smoothing factor for per-worker speed.
    pub speed_ema_alpha: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: PER_HOST_MAX,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            min_chunk_size: MIN_CHUNK,
            max_chunk_size: MAX_CHUNK,
            target_chunk_size: TARGET_CHUNK,
            worker_buffer_size: WORKER_BUFFER,
            max_task_retries: MAX_TASK_RETRIES,
            slow_worker_threshold: SLOW_WORKER_THRESHOLD,
            slow_worker_grace_period: SLOW_WORKER_GRACE,
            stall_timeout: STALL_TIMEOUT,
            speed_ema_alpha: SPEED_EMA_ALPHA,
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-host connection bound.
    #[must_use]
    pub const fn with_max_connections_per_host(mut self, n: usize) -> Self {
        self.max_connections_per_host = n;
        self
    }

    /// Sets the User-Agent header.
    #[must_use]
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Sets the chunk size bounds.
    #[must_use]
    pub const fn with_chunk_sizes(mut self, min: u64, target: u64, max: u64) -> Self {
        self.min_chunk_size = min;
        self.target_chunk_size = target;
        self.max_chunk_size = max;
        self
    }

    /// Sets the per-worker buffer size.
    #[must_use]
    pub const fn with_worker_buffer_size(mut self, size: usize) -> Self {
        self.worker_buffer_size = size;
        self
    }

    /// Sets the per-task retry budget.
    #[must_use]
    pub const fn with_max_task_retries(mut self, retries: u32) -> Self {
        self.max_task_retries = retries;
        self
    }

    /// Sets the slow-worker detection parameters.
    #[must_use]
    pub const fn with_slow_worker(mut self, threshold: f64, grace: Duration) -> Self {
        self.slow_worker_threshold = threshold;
        self.slow_worker_grace_period = grace;
        self
    }

    /// Per-host connection bound, clamped to the crate-wide ceiling.
    #[must_use]
    pub fn connections_per_host(&self) -> usize {
        self.max_connections_per_host.clamp(1, PER_HOST_LIMIT)
    }

    /// Minimum chunk size, aligned down, never zero.
    #[must_use]
    pub fn min_chunk(&self) -> u64 {
        align_down(self.min_chunk_size).max(ALIGN_SIZE)
    }

    /// Maximum chunk size, never below the minimum.
    #[must_use]
    pub fn max_chunk(&self) -> u64 {
        align_down(self.max_chunk_size).max(self.min_chunk())
    }

    /// Target chunk size clamped between min and max.
    #[must_use]
    pub fn target_chunk(&self) -> u64 {
        align_down(self.target_chunk_size).clamp(self.min_chunk(), self.max_chunk())
    }
}

/// Aligns a size down to the 4 KiB split boundary.
#[must_use]
pub const fn align_down(size: u64) -> u64 {
    (size / ALIGN_SIZE) * ALIGN_SIZE
}

/// A download submitted to the pool. Cloned when a paused download is
/// re-queued for resume.
#[derive(Clone)]
pub struct DownloadRequest {
    /// Opaque identifier, stable for the life of the download.
    pub id: String,
    /// Absolute HTTP(S) URL.
    pub url: String,
    /// Directory or file path; a directory gets the resolved filename
    /// appended.
    pub output_path: PathBuf,
    /// Full target path; authoritative when resuming.
    pub dest_path: Option<PathBuf>,
    /// Preferred basename. Overrides the probe-derived name. The manager
    /// writes the final resolved name back here.
    pub filename: Option<String>,
    /// When true, saved state for (url, dest_path) is consulted.
    pub is_resume: bool,
    /// Emit human-readable side output through `log`.
    pub verbose: bool,
    /// Tuned knobs, immutable during the download.
    pub runtime: Arc<RuntimeConfig>,
    /// Event sink; `None` silences events.
    pub events: Option<EventSender>,
    /// The mutable progress state this download owns.
    pub state: Arc<ProgressState>,
}

impl DownloadRequest {
    /// Creates a request with default runtime knobs and fresh state.
    #[must_use]
    pub fn new(id: impl Into<String>, url: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        let id = id.into();
        let state = Arc::new(ProgressState::new(id.clone()));
        Self {
            id,
            url: url.into(),
            output_path: output_path.into(),
            dest_path: None,
            filename: None,
            is_resume: false,
            verbose: false,
            runtime: Arc::new(RuntimeConfig::default()),
            events: None,
            state,
        }
    }

    /// Attaches an event sink.
    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Overrides the runtime knobs.
    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = Arc::new(runtime);
        self
    }

    /// Sets the preferred basename.
    #[must_use]
    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Enables verbose side output.
    #[must_use]
    pub const fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sends an event if a sink is attached and still open.
    pub(crate) fn emit(&self, event: crate::events::DownloadEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runtime_config() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_connections_per_host, PER_HOST_MAX);
        assert_eq!(cfg.max_task_retries, MAX_TASK_RETRIES);
        assert!(cfg.slow_worker_threshold > 0.0 && cfg.slow_worker_threshold < 1.0);
    }

    #[test]
    fn builder_pattern() {
        let cfg = RuntimeConfig::new()
            .with_max_connections_per_host(8)
            .with_user_agent("surge-test/1.0")
            .with_max_task_retries(2);
        assert_eq!(cfg.max_connections_per_host, 8);
        assert_eq!(cfg.user_agent, "surge-test/1.0");
        assert_eq!(cfg.max_task_retries, 2);
    }

    #[test]
    fn connections_per_host_is_clamped() {
        let cfg = RuntimeConfig::new().with_max_connections_per_host(10_000);
        assert_eq!(cfg.connections_per_host(), PER_HOST_LIMIT);

        let cfg = RuntimeConfig::new().with_max_connections_per_host(0);
        assert_eq!(cfg.connections_per_host(), 1);
    }

    #[test]
    fn chunk_accessors_align_and_clamp() {
        let cfg = RuntimeConfig::new().with_chunk_sizes(5000, 70_000, 100_000);
        assert_eq!(cfg.min_chunk() % ALIGN_SIZE, 0);
        assert_eq!(cfg.max_chunk() % ALIGN_SIZE, 0);
        assert!(cfg.target_chunk() >= cfg.min_chunk());
        assert!(cfg.target_chunk() <= cfg.max_chunk());
    }

    #[test]
    fn align_down_rounds_to_4k() {
        assert_eq!(align_down(4096), 4096);
        assert_eq!(align_down(8191), 4096);
        assert_eq!(align_down(0), 0);
    }

    #[test]
    fn request_defaults() {
        let req = DownloadRequest::new("id-1", "https://example.com/f.bin", "/tmp");
        assert!(!req.is_resume);
        assert!(req.dest_path.is_none());
        assert_eq!(req.state.id(), "id-1");
    }
}
