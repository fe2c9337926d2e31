//! Size units, chunking parameters, timeouts and retry budgets shared
//! across the engine.

use std::time::Duration;

/// One kibibyte.
pub const KB: u64 = 1024;
/// One mebibyte.
pub const MB: u64 = KB * 1024;
/// One gibibyte.
pub const GB: u64 = MB * 1024;

/// Every split boundary is aligned down to this size.
pub const ALIGN_SIZE: u64 = 4 * KB;

/// Smallest task the balancer will produce.
pub const MIN_CHUNK: u64 = 256 * KB;
/// Largest task the initial chunker will produce.
pub const MAX_CHUNK: u64 = 32 * MB;
/// Preferred chunk size when the file size gives no better answer.
pub const TARGET_CHUNK: u64 = 8 * MB;

/// Initial tasks generated per worker, so the queue starts with slack
/// for stealing.
pub const TASKS_PER_WORKER: u64 = 6;

/// Default per-worker read/write buffer.
pub const WORKER_BUFFER: usize = 512 * KB as usize;

/// Suffix appended to the destination path while a download is in flight.
pub const INCOMPLETE_SUFFIX: &str = ".part";

/// Upper bound on connections to a single host.
pub const PER_HOST_MAX: usize = 32;
/// Hard ceiling a caller-supplied `max_connections_per_host` is clamped to.
pub const PER_HOST_LIMIT: usize = 256;

/// Attempts per task before it is pushed back for another worker.
pub const MAX_TASK_RETRIES: u32 = 5;
/// Base delay for exponential task-retry backoff (doubles per attempt).
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Probe request timeout, and the pause between probe retries.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
pub const PROBE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Probe attempts before giving up.
pub const PROBE_ATTEMPTS: u32 = 3;

/// TCP connect timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// TCP keepalive interval for pooled connections.
pub const KEEPALIVE_DURATION: Duration = Duration::from_secs(30);
/// How long an idle pooled connection is kept around.
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);
/// Timeout for a read on an established response stream.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Balancer and completion-monitor tick.
pub const BALANCER_INTERVAL: Duration = Duration::from_millis(500);
/// Splits allowed per run; bounds fragmentation.
pub const MAX_SPLITS: u32 = 50;

/// Health-monitor tick.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// A worker slower than this fraction of the live mean is cancelled.
pub const SLOW_WORKER_THRESHOLD: f64 = 0.30;
/// Minimum age of a task attempt before the health monitor may cancel it.
pub const SLOW_WORKER_GRACE: Duration = Duration::from_secs(10);
/// A worker with no progress for this long is considered stalled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// EMA smoothing factor for per-worker speed tracking.
pub const SPEED_EMA_ALPHA: f64 = 0.30;
/// Width of the sliding window feeding the EMA.
pub const SPEED_WINDOW: Duration = Duration::from_secs(2);

/// Poll interval of the progress reporter.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Simultaneous downloads a pool runs by default.
pub const DEFAULT_MAX_DOWNLOADS: usize = 3;
/// Buffered capacity of the pool's submission channel.
pub const POOL_QUEUE_CAPACITY: usize = 100;

/// Default User-Agent; some CDNs reject obviously non-browser agents.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_bounds_are_aligned() {
        assert_eq!(MIN_CHUNK % ALIGN_SIZE, 0);
        assert_eq!(MAX_CHUNK % ALIGN_SIZE, 0);
        assert_eq!(TARGET_CHUNK % ALIGN_SIZE, 0);
    }

    #[test]
    fn chunk_bounds_are_ordered() {
        assert!(MIN_CHUNK < TARGET_CHUNK);
        assert!(TARGET_CHUNK < MAX_CHUNK);
    }

    #[test]
    fn per_host_defaults_within_limit() {
        assert!(PER_HOST_MAX <= PER_HOST_LIMIT);
    }
}
