//! Slow-worker detection.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::constants::HEALTH_CHECK_INTERVAL;
use crate::format::format_speed;

use super::ConcurrentDownloader;

/// Periodically cancels task attempts that are dragging the run down. The
/// owning worker observes the cancellation, re-queues the remainder and
/// picks up fresh work.
pub(super) async fn run_health_monitor(d: Arc<ConcurrentDownloader>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        check_worker_health(&d);
    }
}

fn check_worker_health(d: &ConcurrentDownloader) {
    let active_tasks = d.active_tasks.lock().unwrap();
    if active_tasks.is_empty() {
        return;
    }

    let speeds: Vec<f64> = active_tasks
        .values()
        .map(|at| at.speed())
        .filter(|s| *s > 0.0)
        .collect();
    #[allow(clippy::cast_precision_loss)]
    let mean_speed = if speeds.is_empty() {
        0.0
    } else {
        speeds.iter().sum::<f64>() / speeds.len() as f64
    };

    let grace = d.runtime.slow_worker_grace_period;
    let threshold = d.runtime.slow_worker_threshold;
    let stall = d.runtime.stall_timeout;

    for (worker_id, active) in active_tasks.iter() {
        if active.start_time().elapsed() < grace {
            continue;
        }

        let stalled = active.idle_for() >= stall;
        let speed = active.speed();
        let slow = mean_speed > 0.0 && speed > 0.0 && speed < threshold * mean_speed;

        if stalled || slow {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                log::debug!(
                    "health: worker {worker_id} {} ({} vs mean {}), cancelling attempt",
                    if stalled { "stalled" } else { "slow" },
                    format_speed(speed as u64),
                    format_speed(mean_speed as u64)
                );
            }
            active.cancel_token().cancel();
        }
    }
}
