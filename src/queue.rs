//! Shared FIFO of byte-range tasks with idle-worker accounting.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

use crate::task::{Task, aligned_split_size};

#[derive(Debug)]
struct Inner {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// Thread-safe task FIFO feeding the download workers.
///
/// `pop` waits on an empty, open queue. The idle-worker counter covers the
/// whole `pop` call, which is what lets the balancer tell "workers starved"
/// apart from "queue momentarily empty".
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    idle_workers: AtomicU32,
    min_chunk: u64,
}

/// Decrements the idle counter on every exit path out of `pop`.
struct IdleGuard<'a>(&'a AtomicU32);

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TaskQueue {
    /// Creates an empty queue; `min_chunk` bounds how small splits may get.
    #[must_use]
    pub fn new(min_chunk: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            idle_workers: AtomicU32::new(0),
            min_chunk,
        }
    }

    /// Appends one task and wakes one waiter.
    pub fn push(&self, task: Task) {
        self.inner.lock().unwrap().tasks.push_back(task);
        self.notify.notify_one();
    }

    /// Appends many tasks and wakes every waiter.
    pub fn push_multiple(&self, tasks: impl IntoIterator<Item = Task>) {
        self.inner.lock().unwrap().tasks.extend(tasks);
        self.notify.notify_waiters();
    }

    /// Removes and returns the oldest task, waiting while the queue is
    /// empty but open. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Task> {
        self.idle_workers.fetch_add(1, Ordering::AcqRel);
        let _idle = IdleGuard(&self.idle_workers);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a push between the check
            // and the await cannot be lost.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(task) = inner.tasks.pop_front() {
                    return Some(task);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Closes the queue and unblocks all waiters. Queued tasks already
    /// present are still handed out; only the empty state terminates pops.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    /// True when no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Workers currently inside a `pop` call.
    #[must_use]
    pub fn idle_workers(&self) -> u32 {
        self.idle_workers.load(Ordering::Acquire)
    }

    /// Removes and returns every queued task. Used by the pause collector.
    #[must_use]
    pub fn drain_remaining(&self) -> Vec<Task> {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.drain(..).collect()
    }

    /// Splits the largest queued task in half (4 KiB-aligned) when both
    /// halves stay at or above `min_chunk`. The split replaces the original
    /// in place and appends the other half, so queue order is preserved.
    /// Returns whether a split occurred.
    pub fn split_largest_if_needed(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let mut idx = None;
        let mut max_len = 0;
        for (i, t) in inner.tasks.iter().enumerate() {
            if t.length > max_len && t.length > 2 * self.min_chunk {
                max_len = t.length;
                idx = Some(i);
            }
        }
        let Some(idx) = idx else {
            return false;
        };

        let t = inner.tasks[idx];
        let half = aligned_split_size(t.length, self.min_chunk);
        if half == 0 {
            return false;
        }

        let left = Task::new(t.offset, half);
        let right = Task::new(t.offset + half, t.length - half);
        inner.tasks[idx] = right;
        inner.tasks.push_back(left);
        drop(inner);

        self.notify.notify_waiters();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const MIN: u64 = 256 * 1024;

    #[tokio::test]
    async fn pop_returns_pushed_tasks_in_order() {
        let q = TaskQueue::new(MIN);
        q.push(Task::new(0, 10));
        q.push(Task::new(10, 10));

        assert_eq!(q.pop().await, Some(Task::new(0, 10)));
        assert_eq!(q.pop().await, Some(Task::new(10, 10)));
    }

    #[tokio::test]
    async fn pop_blocks_until_push() {
        let q = Arc::new(TaskQueue::new(MIN));
        let q2 = Arc::clone(&q);

        let popper = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!popper.is_finished());

        q.push(Task::new(0, 5));
        assert_eq!(popper.await.unwrap(), Some(Task::new(0, 5)));
    }

    #[tokio::test]
    async fn close_unblocks_waiters() {
        let q = Arc::new(TaskQueue::new(MIN));
        let q2 = Arc::clone(&q);

        let popper = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        assert_eq!(popper.await.unwrap(), None);
    }

    #[tokio::test]
    async fn queued_tasks_survive_close() {
        let q = TaskQueue::new(MIN);
        q.push(Task::new(0, 5));
        q.close();
        assert_eq!(q.pop().await, Some(Task::new(0, 5)));
        assert_eq!(q.pop().await, None);
    }

    #[tokio::test]
    async fn idle_counter_covers_blocked_pop() {
        let q = Arc::new(TaskQueue::new(MIN));
        let q2 = Arc::clone(&q);

        assert_eq!(q.idle_workers(), 0);
        let popper = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.idle_workers(), 1);

        q.close();
        popper.await.unwrap();
        assert_eq!(q.idle_workers(), 0);
    }

    #[test]
    fn drain_remaining_empties_queue() {
        let q = TaskQueue::new(MIN);
        q.push_multiple([Task::new(0, 10), Task::new(10, 20)]);

        let drained = q.drain_remaining();
        assert_eq!(drained, vec![Task::new(0, 10), Task::new(10, 20)]);
        assert!(q.is_empty());
        assert!(q.drain_remaining().is_empty());
    }

    #[test]
    fn split_preserves_coverage() {
        let q = TaskQueue::new(MIN);
        let original = Task::new(0, 8 * MIN);
        q.push(original);

        assert!(q.split_largest_if_needed());

        let tasks = q.drain_remaining();
        assert_eq!(tasks.len(), 2);
        let total: u64 = tasks.iter().map(|t| t.length).sum();
        assert_eq!(total, original.length);
        // The two halves must tile the original range.
        let mut sorted = tasks;
        sorted.sort_by_key(|t| t.offset);
        assert_eq!(sorted[0].offset, 0);
        assert_eq!(sorted[0].end(), sorted[1].offset);
        assert_eq!(sorted[1].end(), original.end());
    }

    #[test]
    fn split_refuses_small_tasks() {
        let q = TaskQueue::new(MIN);
        q.push(Task::new(0, 2 * MIN));
        assert!(!q.split_largest_if_needed());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn split_picks_the_largest() {
        let q = TaskQueue::new(MIN);
        q.push(Task::new(0, 3 * MIN));
        q.push(Task::new(3 * MIN, 16 * MIN));

        assert!(q.split_largest_if_needed());
        let tasks = q.drain_remaining();
        // The small task is untouched.
        assert!(tasks.contains(&Task::new(0, 3 * MIN)));
        let total: u64 = tasks.iter().map(|t| t.length).sum();
        assert_eq!(total, 19 * MIN);
    }
}
