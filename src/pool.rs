//! Bounded concurrency over many simultaneous downloads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DownloadRequest;
use crate::constants::{DEFAULT_MAX_DOWNLOADS, POOL_QUEUE_CAPACITY};
use crate::error::Error;
use crate::events::{DownloadEvent, EventSender};
use crate::manager::Manager;
use crate::store::{DownloadEntry, DownloadStatus, StateStore};

/// Observer-facing snapshot of one download's place in the pool.
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    pub id: String,
    pub url: String,
    pub filename: String,
    /// `queued`, `downloading`, `pausing`, `paused`, `completed` or `error`.
    pub status: String,
    pub total_size: u64,
    pub downloaded: u64,
    /// Percent complete, 0 when the size is unknown.
    pub progress: f64,
    /// Session speed in bytes per second.
    pub speed: f64,
    pub error: Option<String>,
}

struct ActiveDownload {
    request: DownloadRequest,
    cancel: CancellationToken,
}

struct PoolInner {
    /// Running or paused-but-resumable downloads.
    downloads: Mutex<HashMap<String, ActiveDownload>>,
    /// Submitted but not yet picked up by a worker.
    queued: Mutex<HashMap<String, DownloadRequest>>,
    in_flight: AtomicUsize,
}

/// Runs up to `max_downloads` downloads at once; everything else waits in a
/// bounded submission queue.
pub struct WorkerPool {
    tx: mpsc::Sender<DownloadRequest>,
    events: EventSender,
    store: Arc<StateStore>,
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates the pool and spawns its worker slots.
    #[must_use]
    pub fn new(events: EventSender, store: Arc<StateStore>, max_downloads: usize) -> Self {
        let max_downloads = if max_downloads == 0 {
            DEFAULT_MAX_DOWNLOADS
        } else {
            max_downloads
        };

        let (tx, rx) = mpsc::channel::<DownloadRequest>(POOL_QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let inner = Arc::new(PoolInner {
            downloads: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
        });

        let manager = Arc::new(Manager::new(Arc::clone(&store)));
        for _ in 0..max_downloads {
            tokio::spawn(pool_worker(
                Arc::clone(&rx),
                Arc::clone(&inner),
                Arc::clone(&manager),
                Arc::clone(&store),
                events.clone(),
            ));
        }

        Self {
            tx,
            events,
            store,
            inner,
        }
    }

    /// Submits a download. Waits only when the submission buffer is full.
    pub async fn add(&self, request: DownloadRequest) {
        self.inner
            .queued
            .lock()
            .unwrap()
            .insert(request.id.clone(), request.clone());
        if self.tx.send(request).await.is_err() {
            log::error!("worker pool channel closed, dropping submission");
        }
    }

    /// Whether this URL is already tracked, live or persisted.
    #[must_use]
    pub fn has_download(&self, url: &str) -> bool {
        {
            let downloads = self.inner.downloads.lock().unwrap();
            if downloads.values().any(|ad| ad.request.url == url) {
                return true;
            }
        }
        {
            let queued = self.inner.queued.lock().unwrap();
            if queued.values().any(|req| req.url == url) {
                return true;
            }
        }
        self.store.check_download_exists(url).unwrap_or(false)
    }

    /// Number of live (not paused, not done) plus queued downloads.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let downloads = self.inner.downloads.lock().unwrap();
        let live = downloads
            .values()
            .filter(|ad| !ad.request.state.is_done() && !ad.request.state.is_paused())
            .count();
        live + self.inner.queued.lock().unwrap().len()
    }

    /// Pauses one download. Idempotent: already paused, pausing or done
    /// entries are left alone. The entry stays resumable.
    pub fn pause(&self, id: &str) {
        let downloads = self.inner.downloads.lock().unwrap();
        let Some(ad) = downloads.get(id) else {
            return;
        };
        let state = &ad.request.state;
        if state.is_pausing() || state.is_paused() {
            return;
        }
        state.set_pausing(true);
        state.pause();
        let downloaded = state.downloaded();
        drop(downloads);

        let _ = self.events.send(DownloadEvent::Paused {
            id: id.to_string(),
            downloaded,
        });
    }

    /// Pauses every live download.
    pub fn pause_all(&self) {
        let ids: Vec<String> = {
            let downloads = self.inner.downloads.lock().unwrap();
            downloads
                .iter()
                .filter(|(_, ad)| {
                    let s = &ad.request.state;
                    !s.is_paused() && !s.is_done() && !s.is_pausing()
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.pause(&id);
        }
    }

    /// Resumes a paused download by re-submitting it with saved state.
    /// Refused while the pause is still tearing down.
    pub async fn resume(&self, id: &str) {
        let request = {
            let downloads = self.inner.downloads.lock().unwrap();
            let Some(ad) = downloads.get(id) else {
                return;
            };
            let state = &ad.request.state;
            if state.is_pausing() {
                log::debug!("resume ignored: {id} is still pausing");
                return;
            }
            if !state.is_paused() {
                log::debug!("resume ignored: {id} is already running");
                return;
            }
            state.resume();
            state.sync_session_start();

            let mut request = ad.request.clone();
            request.is_resume = true;
            request
        };

        let _ = self.events.send(DownloadEvent::Resumed { id: id.to_string() });
        self.add(request).await;
    }

    /// Cancels and forgets a download. The `.part` file is left on disk for
    /// the caller to reap.
    pub fn cancel(&self, id: &str) {
        if let Some(req) = self.inner.queued.lock().unwrap().remove(id) {
            // Still waiting for a slot; the worker skips done entries.
            req.state.set_done();
        }
        let removed = self.inner.downloads.lock().unwrap().remove(id);
        let Some(ad) = removed else {
            return;
        };
        ad.cancel.cancel();
        ad.request.state.set_done();
    }

    /// Unified status view for observers.
    #[must_use]
    pub fn get_status(&self, id: &str) -> Option<DownloadSnapshot> {
        {
            let queued = self.inner.queued.lock().unwrap();
            if let Some(req) = queued.get(id) {
                return Some(DownloadSnapshot {
                    id: id.to_string(),
                    url: req.url.clone(),
                    filename: req.filename.clone().unwrap_or_default(),
                    status: "queued".to_string(),
                    total_size: 0,
                    downloaded: 0,
                    progress: 0.0,
                    speed: 0.0,
                    error: None,
                });
            }
        }

        let downloads = self.inner.downloads.lock().unwrap();
        let ad = downloads.get(id)?;
        let state = &ad.request.state;
        let p = state.progress();

        let error = state.error();
        let status = if error.is_some() {
            "error"
        } else if state.is_pausing() {
            "pausing"
        } else if state.is_paused() {
            "paused"
        } else if state.is_done() {
            "completed"
        } else {
            "downloading"
        };

        #[allow(clippy::cast_precision_loss)]
        let progress = if p.total > 0 {
            p.downloaded as f64 * 100.0 / p.total as f64
        } else {
            0.0
        };

        let session_bytes = p.downloaded.saturating_sub(p.session_start_bytes);
        #[allow(clippy::cast_precision_loss)]
        let speed = if p.elapsed.as_secs_f64() > 0.0 && session_bytes > 0 {
            session_bytes as f64 / p.elapsed.as_secs_f64()
        } else {
            0.0
        };

        Some(DownloadSnapshot {
            id: id.to_string(),
            url: ad.request.url.clone(),
            filename: ad.request.filename.clone().unwrap_or_default(),
            status: status.to_string(),
            total_size: p.total,
            downloaded: p.downloaded,
            progress,
            speed,
            error,
        })
    }

    /// Pauses everything, waits (bounded) for pause teardowns to persist,
    /// then waits for in-flight workers to finish.
    pub async fn graceful_shutdown(&self) {
        self.pause_all();

        // Bounded wait: no pause teardown (and its state write) should be
        // cut off mid-transaction.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let still_pausing = {
                let downloads = self.inner.downloads.lock().unwrap();
                downloads
                    .values()
                    .any(|ad| ad.request.state.is_pausing())
            };
            if !still_pausing {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                log::debug!("graceful shutdown: timed out waiting for pauses");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        while self.inner.in_flight.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn pool_worker(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DownloadRequest>>>,
    inner: Arc<PoolInner>,
    manager: Arc<Manager>,
    store: Arc<StateStore>,
    events: EventSender,
) {
    loop {
        let request = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(mut request) = request else {
            return;
        };

        // Cancelled while still queued: skip silently.
        if request.state.is_done() {
            inner.queued.lock().unwrap().remove(&request.id);
            continue;
        }

        inner.in_flight.fetch_add(1, Ordering::AcqRel);

        let cancel = CancellationToken::new();
        inner.queued.lock().unwrap().remove(&request.id);
        inner.downloads.lock().unwrap().insert(
            request.id.clone(),
            ActiveDownload {
                request: request.clone(),
                cancel: cancel.clone(),
            },
        );

        let result = manager.run(&cancel, &mut request).await;

        // The manager resolved filename/dest during the run; keep the
        // tracked entry in sync for status queries and future resumes.
        if let Some(ad) = inner.downloads.lock().unwrap().get_mut(&request.id) {
            ad.request.filename.clone_from(&request.filename);
            ad.request.dest_path.clone_from(&request.dest_path);
        }

        let state = Arc::clone(&request.state);
        let is_paused = state.is_paused();
        state.set_pausing(false);

        match result {
            _ if is_paused => {
                // Stays in `downloads` for a later resume.
                log::debug!("pool: download {} paused cleanly", request.id);
            }
            Ok(()) => {
                state.set_done();
                inner.downloads.lock().unwrap().remove(&request.id);
                record_terminal(&store, &request, DownloadStatus::Completed);
            }
            Err(Error::Cancelled) => {
                inner.downloads.lock().unwrap().remove(&request.id);
            }
            Err(Error::Paused) => {
                // Pause flag already cleared by a racing resume; treat like
                // a pause that will be resubmitted.
                log::debug!("pool: download {} paused (flag cleared)", request.id);
            }
            Err(e) => {
                state.set_error(e.to_string());
                let _ = events.send(DownloadEvent::Error {
                    id: request.id.clone(),
                    message: e.to_string(),
                });
                inner.downloads.lock().unwrap().remove(&request.id);
                record_terminal(&store, &request, DownloadStatus::Error);
            }
        }

        inner.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Records a terminal outcome in the master list.
fn record_terminal(store: &StateStore, request: &DownloadRequest, status: DownloadStatus) {
    let p = request.state.progress();
    let elapsed = request.state.saved_elapsed() + p.elapsed;
    let entry = DownloadEntry {
        id: request.id.clone(),
        url: request.url.clone(),
        dest_path: request.dest_path.clone().unwrap_or_default(),
        filename: request.filename.clone().unwrap_or_default(),
        status,
        total_size: p.total,
        downloaded: p.downloaded,
        completed_at: (status == DownloadStatus::Completed)
            .then(|| chrono::Utc::now().timestamp()),
        time_taken: Some(elapsed),
        url_hash: String::new(),
    };
    if let Err(e) = store.add_to_master_list(&entry) {
        log::error!("failed to record download outcome: {e}");
    }
}
