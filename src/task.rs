//! Byte-range tasks and the live per-worker tracker.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::constants::{ALIGN_SIZE, SPEED_WINDOW};

/// A half-open byte range `[offset, offset + length)` owned by exactly one
/// worker at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    /// First byte of the range.
    pub offset: u64,
    /// Number of bytes in the range.
    pub length: u64,
}

impl Task {
    /// Creates a task covering `[offset, offset + length)`.
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end of the range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A task currently being fetched by a worker.
///
/// `current_offset` and `stop_at` are atomics because the balancer lowers
/// `stop_at` while the owning worker is mid-read; the worker re-reads it on
/// every buffer fill. `stop_at` only ever decreases for a given attempt.
#[derive(Debug)]
pub struct ActiveTask {
    task: Task,
    current_offset: AtomicU64,
    stop_at: AtomicU64,
    /// Unix nanos of the last byte received.
    last_activity: AtomicI64,
    start_time: Instant,
    speed: Mutex<f64>,
    window_start: Mutex<Instant>,
    window_bytes: AtomicU64,
    cancel: CancellationToken,
}

impl ActiveTask {
    /// Registers a fresh attempt at `task`, cancellable via `cancel`.
    #[must_use]
    pub fn new(task: Task, cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            task,
            current_offset: AtomicU64::new(task.offset),
            stop_at: AtomicU64::new(task.end()),
            last_activity: AtomicI64::new(unix_nanos_now()),
            start_time: now,
            speed: Mutex::new(0.0),
            window_start: Mutex::new(now),
            window_bytes: AtomicU64::new(0),
            cancel,
        }
    }

    /// The range originally assigned to this attempt.
    #[must_use]
    pub const fn task(&self) -> Task {
        self.task
    }

    /// Next byte this worker will fetch.
    #[must_use]
    pub fn current_offset(&self) -> u64 {
        self.current_offset.load(Ordering::Acquire)
    }

    /// Advances the worker's position after a write.
    pub fn advance_to(&self, offset: u64) {
        self.current_offset.store(offset, Ordering::Release);
    }

    /// Exclusive upper bound of the work this attempt still owns.
    #[must_use]
    pub fn stop_at(&self) -> u64 {
        self.stop_at.load(Ordering::Acquire)
    }

    /// Lowers the upper bound; the range past it now belongs to whoever
    /// queued the stolen tail.
    pub fn lower_stop_at(&self, new_stop_at: u64) {
        self.stop_at.store(new_stop_at, Ordering::Release);
    }

    /// When this attempt started.
    #[must_use]
    pub const fn start_time(&self) -> Instant {
        self.start_time
    }

    /// The cancel handle for this attempt.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Bytes left between the worker's position and its upper bound.
    #[must_use]
    pub fn remaining_bytes(&self) -> u64 {
        let current = self.current_offset();
        let stop_at = self.stop_at();
        stop_at.saturating_sub(current)
    }

    /// The unfinished portion as a task, or `None` when complete.
    #[must_use]
    pub fn remaining_task(&self) -> Option<Task> {
        let current = self.current_offset();
        let stop_at = self.stop_at();
        (current < stop_at).then(|| Task::new(current, stop_at - current))
    }

    /// EMA-smoothed speed in bytes per second.
    #[must_use]
    pub fn speed(&self) -> f64 {
        *self.speed.lock().unwrap()
    }

    /// Duration since the last byte was received.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Acquire);
        let now = unix_nanos_now();
        Duration::from_nanos(now.saturating_sub(last).unsigned_abs())
    }

    /// Records `n` freshly received bytes and folds the sliding window into
    /// the EMA once the window is old enough.
    #[allow(clippy::cast_precision_loss)]
    pub fn note_progress(&self, n: u64, alpha: f64) {
        self.window_bytes.fetch_add(n, Ordering::AcqRel);
        self.last_activity.store(unix_nanos_now(), Ordering::Release);

        let mut window_start = self.window_start.lock().unwrap();
        let elapsed = window_start.elapsed();
        if elapsed < SPEED_WINDOW {
            return;
        }

        let window_bytes = self.window_bytes.swap(0, Ordering::AcqRel);
        let recent = window_bytes as f64 / elapsed.as_secs_f64();

        let mut speed = self.speed.lock().unwrap();
        *speed = if *speed == 0.0 {
            recent
        } else {
            (1.0 - alpha) * *speed + alpha * recent
        };
        *window_start = Instant::now();
    }
}

/// Half of `remaining`, aligned down to the split boundary. Returns 0 when
/// either half would fall below `min_chunk`, meaning: do not split.
#[must_use]
pub fn aligned_split_size(remaining: u64, min_chunk: u64) -> u64 {
    let half = (remaining / 2 / ALIGN_SIZE) * ALIGN_SIZE;
    if half < min_chunk { 0 } else { half }
}

fn unix_nanos_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MIN_CHUNK;

    #[test]
    fn task_end_is_exclusive() {
        let t = Task::new(4096, 1024);
        assert_eq!(t.end(), 5120);
    }

    #[test]
    fn remaining_shrinks_as_offset_advances() {
        let at = ActiveTask::new(Task::new(0, 1000), CancellationToken::new());
        assert_eq!(at.remaining_bytes(), 1000);

        at.advance_to(400);
        assert_eq!(at.remaining_bytes(), 600);
        assert_eq!(at.remaining_task(), Some(Task::new(400, 600)));
    }

    #[test]
    fn remaining_is_none_once_stop_at_reached() {
        let at = ActiveTask::new(Task::new(0, 1000), CancellationToken::new());
        at.lower_stop_at(400);
        at.advance_to(400);
        assert_eq!(at.remaining_bytes(), 0);
        assert_eq!(at.remaining_task(), None);
    }

    #[test]
    fn remaining_clamps_when_offset_passes_stop_at() {
        let at = ActiveTask::new(Task::new(0, 1000), CancellationToken::new());
        at.advance_to(800);
        at.lower_stop_at(600);
        assert_eq!(at.remaining_bytes(), 0);
        assert_eq!(at.remaining_task(), None);
    }

    #[test]
    fn aligned_split_rounds_down() {
        let split = aligned_split_size(10 * MIN_CHUNK + 123, MIN_CHUNK);
        assert_eq!(split % ALIGN_SIZE, 0);
        assert!(split >= MIN_CHUNK);
        assert!(split <= 5 * MIN_CHUNK + ALIGN_SIZE);
    }

    #[test]
    fn aligned_split_refuses_small_remainders() {
        assert_eq!(aligned_split_size(MIN_CHUNK, MIN_CHUNK), 0);
        assert_eq!(aligned_split_size(2 * MIN_CHUNK - 1, MIN_CHUNK), 0);
    }

    #[test]
    fn speed_starts_at_zero() {
        let at = ActiveTask::new(Task::new(0, 10), CancellationToken::new());
        assert_eq!(at.speed(), 0.0);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn split_is_always_aligned(remaining in 0u64..u64::MAX / 2, min in 1u64..64 * 1024 * 1024) {
                let split = aligned_split_size(remaining, min);
                prop_assert_eq!(split % ALIGN_SIZE, 0);
                prop_assert!(split == 0 || split >= min);
                prop_assert!(split <= remaining);
            }
        }
    }
}
