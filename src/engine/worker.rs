//! Worker loop: pops tasks, fetches ranges, writes at offsets.

use std::sync::Arc;
use std::time::SystemTime;

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{RANGE, RETRY_AFTER, USER_AGENT};
use tokio_util::sync::CancellationToken;

use crate::constants::RETRY_BASE_DELAY;
use crate::error::{Error, Result};
use crate::fs::write_at_all;
use crate::queue::TaskQueue;
use crate::task::{ActiveTask, Task};

use super::ConcurrentDownloader;

/// One worker: pops tasks until the queue closes, retrying each task with
/// exponential backoff and re-queueing what it cannot finish.
pub(super) async fn run_worker(
    d: Arc<ConcurrentDownloader>,
    worker_id: usize,
    url: String,
    file: Arc<std::fs::File>,
    queue: Arc<TaskQueue>,
    client: reqwest::Client,
    parent: CancellationToken,
) -> Result<()> {
    let mut buf = d.buffers.get();
    log::debug!("worker {worker_id} started");

    let result = worker_loop(&d, worker_id, &url, &file, &queue, &client, &parent, &mut buf).await;

    d.buffers.put(buf);
    log::debug!("worker {worker_id} finished");
    result
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    d: &Arc<ConcurrentDownloader>,
    worker_id: usize,
    url: &str,
    file: &Arc<std::fs::File>,
    queue: &Arc<TaskQueue>,
    client: &reqwest::Client,
    parent: &CancellationToken,
    buf: &mut [u8],
) -> Result<()> {
    while let Some(mut task) = queue.pop().await {
        d.state.worker_started();

        let mut last_err: Option<Error> = None;
        let max_retries = d.runtime.max_task_retries.max(1);

        for attempt in 0..max_retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
            }

            let task_token = parent.child_token();
            let active = Arc::new(ActiveTask::new(task, task_token.clone()));
            d.register_active(worker_id, Arc::clone(&active));

            let result = download_task(d, client, url, file, &active, buf, &task_token).await;

            // The health monitor and the parent share the cancellation
            // mechanism; capture the token state before anything else so
            // the two outcomes stay distinguishable.
            let was_externally_cancelled = task_token.is_cancelled();

            if parent.is_cancelled() {
                // Leave the active task registered: the pause collector
                // reads the remaining range out of it.
                d.state.worker_finished();
                return Err(Error::Cancelled);
            }

            if was_externally_cancelled && result.is_err() {
                // Health-cancelled: re-queue only what is left, clamped to
                // the original range, and move on to a fresh task.
                if let Some(mut remaining) = active.remaining_task() {
                    let original_end = task.end();
                    if remaining.end() > original_end {
                        remaining.length = original_end.saturating_sub(remaining.offset);
                    }
                    if remaining.length > 0 {
                        log::debug!(
                            "worker {worker_id}: health-cancelled, re-queueing {} bytes at offset {}",
                            remaining.length,
                            remaining.offset
                        );
                        queue.push(remaining);
                    }
                }
                d.remove_active(worker_id);
                last_err = None;
                break;
            }

            d.remove_active(worker_id);

            match result {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e @ Error::Io(_)) => {
                    // Disk errors abort the whole download.
                    d.state.worker_finished();
                    return Err(e);
                }
                Err(e) => {
                    // Keep only the remainder for the next attempt so a
                    // partially completed attempt is not double-counted.
                    let current = active.current_offset();
                    if current > task.offset {
                        task = Task::new(current, task.end() - current);
                    }
                    last_err = Some(e);
                }
            }
        }

        d.state.worker_finished();

        if let Some(e) = last_err {
            log::debug!(
                "task at offset {} failed after {max_retries} attempts: {e}",
                task.offset
            );
            queue.push(task);
        }
    }

    Ok(())
}

/// Fetches one byte range and writes it at its offset, honoring `stop_at`
/// adjustments from the balancer on every buffer fill.
async fn download_task(
    d: &ConcurrentDownloader,
    client: &reqwest::Client,
    url: &str,
    file: &std::fs::File,
    active: &ActiveTask,
    buf: &mut [u8],
    token: &CancellationToken,
) -> Result<()> {
    let task = active.task();

    d.limiter.wait_if_blocked().await;

    let request = client
        .get(url)
        .header(USER_AGENT, &d.runtime.user_agent)
        .header(
            RANGE,
            format!("bytes={}-{}", task.offset, task.end() - 1),
        )
        .send();

    let resp = tokio::select! {
        () = token.cancelled() => return Err(Error::Cancelled),
        r = request => r?,
    };

    match resp.status() {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let wait = d.limiter.handle_429(retry_after.as_deref());
            d.state.set_rate_limited_until(SystemTime::now() + wait);
            return Err(Error::RateLimited);
        }
        StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
        status => return Err(Error::UnexpectedStatus(status.as_u16())),
    }
    d.limiter.report_success();

    let alpha = d.runtime.speed_ema_alpha;
    let mut stream = resp.bytes_stream();
    let mut leftover: Option<bytes::Bytes> = None;
    let mut offset = task.offset;

    loop {
        let stop_at = active.stop_at();
        if offset >= stop_at {
            // The tail was stolen; it is someone else's range now.
            return Ok(());
        }

        // Fill the buffer up to the (possibly shrunken) range end.
        let want = usize::try_from((stop_at - offset).min(buf.len() as u64)).unwrap_or(buf.len());
        let mut filled = 0usize;
        let mut eof = false;

        while filled < want {
            let chunk = match leftover.take() {
                Some(chunk) => chunk,
                None => {
                    let next = tokio::select! {
                        () = token.cancelled() => return Err(Error::Cancelled),
                        c = stream.next() => c,
                    };
                    match next {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            eof = true;
                            break;
                        }
                    }
                }
            };
            if chunk.is_empty() {
                continue;
            }
            let take = chunk.len().min(want - filled);
            buf[filled..filled + take].copy_from_slice(&chunk[..take]);
            if take < chunk.len() {
                leftover = Some(chunk.slice(take..));
            }
            filled += take;
        }

        if filled > 0 {
            // Re-check stop_at: the balancer may have lowered it while we
            // were reading. Never write into the stolen region.
            let stop_now = active.stop_at();
            let writable =
                usize::try_from((stop_now.saturating_sub(offset)).min(filled as u64)).unwrap_or(0);
            if writable == 0 {
                return Ok(());
            }

            write_at_all(file, &buf[..writable], offset).map_err(Error::Io)?;

            let old_offset = offset;
            offset += writable as u64;
            active.advance_to(offset);
            active.note_progress(writable as u64, alpha);

            // Clamped contribution: bytes past the current stop_at belong
            // to whoever owns the stolen tail, so they are never counted
            // here. This is what keeps `downloaded` exact.
            let effective_end = offset.min(active.stop_at());
            if effective_end > old_offset {
                d.state.add_downloaded(effective_end - old_offset);
            }
        }

        if eof {
            if offset < active.stop_at() {
                return Err(Error::Download(format!(
                    "connection closed {} bytes short of the requested range",
                    active.stop_at() - offset
                )));
            }
            return Ok(());
        }
    }
}
