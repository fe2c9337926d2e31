//! Dynamic re-balancing: queue splits, work stealing and run completion.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::constants::{BALANCER_INTERVAL, MAX_SPLITS};
use crate::progress::ProgressState;
use crate::queue::TaskQueue;
use crate::task::{Task, aligned_split_size};

use super::ConcurrentDownloader;

/// Feeds idle workers: splits queued tasks first, steals from the busiest
/// active worker when the queue is dry. Bounded by [`MAX_SPLITS`] per run
/// so the task list cannot fragment without limit.
pub(super) async fn run_balancer(
    d: Arc<ConcurrentDownloader>,
    queue: Arc<TaskQueue>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(BALANCER_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut split_count = 0u32;

    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if queue.idle_workers() == 0 || split_count >= MAX_SPLITS {
            continue;
        }

        if queue.split_largest_if_needed() {
            split_count += 1;
            log::debug!("balancer: split largest queued task (total splits: {split_count})");
        } else if queue.is_empty() && steal_work(&d, &queue) {
            split_count += 1;
        }
    }
}

/// Lowers `stop_at` on the active task with the most remaining work and
/// queues the stolen tail. Returns whether a chunk was actually produced.
pub(super) fn steal_work(d: &ConcurrentDownloader, queue: &TaskQueue) -> bool {
    let active_tasks = d.active_tasks.lock().unwrap();

    let min_chunk = d.runtime.min_chunk();
    let Some((victim_id, victim)) = active_tasks
        .iter()
        .filter(|(_, at)| at.remaining_bytes() > min_chunk)
        .max_by_key(|(_, at)| at.remaining_bytes())
        .map(|(id, at)| (*id, Arc::clone(at)))
    else {
        return false;
    };
    drop(active_tasks);

    let remaining = victim.remaining_bytes();
    let split = aligned_split_size(remaining, min_chunk);
    if split == 0 {
        return false;
    }

    let current = victim.current_offset();
    let new_stop_at = current + split;
    victim.lower_stop_at(new_stop_at);

    // The worker may have streamed past the new bound before it saw the
    // store; the stolen range must start where the worker actually stops.
    let final_current = victim.current_offset();
    let stolen_start = new_stop_at.max(final_current);
    let original_end = current + remaining;
    if stolen_start >= original_end {
        return false;
    }

    let stolen = Task::new(stolen_start, original_end - stolen_start);
    log::debug!(
        "balancer: stole {} bytes from worker {victim_id} (range {}-{})",
        stolen.length,
        stolen.offset,
        stolen.end()
    );
    queue.push(stolen);
    true
}

/// Closes the queue once all work is provably finished: nothing queued and
/// either every worker is idle or the byte count already covers the file
/// (a guard against stuck idle accounting).
pub(super) async fn run_completion_monitor(
    state: Arc<ProgressState>,
    queue: Arc<TaskQueue>,
    num_workers: u32,
    file_size: u64,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(BALANCER_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = stop.cancelled() => {
                queue.close();
                return;
            }
            _ = ticker.tick() => {}
        }

        // Retries sitting in the queue must never be cut off, so the queue
        // has to be empty before byte counts are even considered.
        if queue.is_empty()
            && (queue.idle_workers() == num_workers || state.downloaded() >= file_size)
        {
            queue.close();
            return;
        }
    }
}
