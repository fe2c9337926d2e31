//! Multi-connection download engine.
//!
//! One `ConcurrentDownloader` instance drives one run: it seeds a task
//! queue (fresh chunks or saved state), launches N workers plus the
//! balancer, completion and health monitors, and finalizes the run into
//! exactly one of: renamed destination file, persisted pause state, or an
//! error.

mod balancer;
mod health;
mod worker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::constants::{
    DIAL_TIMEOUT, GB, IDLE_CONN_TIMEOUT, INCOMPLETE_SUFFIX, KEEPALIVE_DURATION, MB,
    PER_HOST_MAX, READ_TIMEOUT, TASKS_PER_WORKER,
};
use crate::error::{Error, Result};
use crate::format::format_bytes;
use crate::fs::FileSystem;
use crate::limiter::{self, HostLimiter};
use crate::progress::ProgressState;
use crate::store::{DownloadState, StateStore};
use crate::task::{ActiveTask, Task};

/// Appends the in-flight suffix to a destination path.
#[must_use]
pub fn part_path(dest: &Path) -> PathBuf {
    let mut os = dest.as_os_str().to_os_string();
    os.push(INCOMPLETE_SUFFIX);
    PathBuf::from(os)
}

/// Recycles worker buffers across tasks within one run.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    size: usize,
}

impl BufferPool {
    fn new(size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            size,
        }
    }

    fn get(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size])
    }

    fn put(&self, buf: Vec<u8>) {
        if buf.len() == self.size {
            self.buffers.lock().unwrap().push(buf);
        }
    }
}

/// Handles multi-connection downloads for a single run.
pub struct ConcurrentDownloader {
    id: String,
    state: Arc<ProgressState>,
    runtime: Arc<RuntimeConfig>,
    store: Arc<StateStore>,
    fs: Arc<dyn FileSystem>,
    limiter: Arc<HostLimiter>,
    active_tasks: Mutex<HashMap<usize, Arc<ActiveTask>>>,
    buffers: BufferPool,
}

impl ConcurrentDownloader {
    /// Creates a downloader bound to one download's id, state and host.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        host: &str,
        state: Arc<ProgressState>,
        runtime: Arc<RuntimeConfig>,
        store: Arc<StateStore>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let buffer_size = runtime.worker_buffer_size;
        Self {
            id: id.into(),
            state,
            runtime,
            store,
            fs,
            limiter: limiter::for_host(host),
            active_tasks: Mutex::new(HashMap::new()),
            buffers: BufferPool::new(buffer_size),
        }
    }

    /// Connection count by file-size band, bounded by the configured
    /// per-host maximum.
    fn initial_connections(&self, file_size: u64) -> usize {
        let recommended = match file_size {
            s if s < 10 * MB => 1,
            s if s < 100 * MB => 4,
            s if s < GB => 6,
            _ => PER_HOST_MAX,
        };
        recommended.min(self.runtime.connections_per_host())
    }

    /// Chunk size targeting a few tasks per worker, clamped and aligned.
    fn chunk_size(&self, file_size: u64, num_conns: usize) -> u64 {
        let target_tasks = num_conns as u64 * TASKS_PER_WORKER;
        let mut chunk = file_size / target_tasks.max(1);
        if chunk == 0 {
            chunk = self.runtime.target_chunk();
        }
        let chunk = chunk.clamp(self.runtime.min_chunk(), self.runtime.max_chunk());
        crate::config::align_down(chunk).max(crate::constants::ALIGN_SIZE)
    }

    /// HTTP client tuned for many parallel range requests: HTTP/1.1 only so
    /// every connection is its own TCP stream, compression off because
    /// payloads usually are compressed already.
    fn build_client(&self, num_conns: usize) -> Result<reqwest::Client> {
        let client = reqwest::Client::builder()
            .http1_only()
            .pool_max_idle_per_host(num_conns + 2)
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .connect_timeout(DIAL_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .tcp_keepalive(KEEPALIVE_DURATION)
            .build()?;
        Ok(client)
    }

    fn register_active(&self, worker_id: usize, active: Arc<ActiveTask>) {
        self.active_tasks.lock().unwrap().insert(worker_id, active);
    }

    fn remove_active(&self, worker_id: usize) {
        self.active_tasks.lock().unwrap().remove(&worker_id);
    }

    /// Downloads `url` into `dest_path + ".part"` using multiple
    /// connections, then renames into place.
    ///
    /// # Errors
    ///
    /// [`Error::Paused`] when the run ended via pause (state persisted),
    /// [`Error::Cancelled`] when cancelled without pause, the first fatal
    /// worker error otherwise.
    pub async fn download(
        self: Arc<Self>,
        parent: &CancellationToken,
        url: &str,
        dest_path: &Path,
        file_size: u64,
        is_resume: bool,
        verbose: bool,
    ) -> Result<()> {
        log::debug!(
            "concurrent download: {url} -> {} (size: {file_size})",
            dest_path.display()
        );

        let working_path = part_path(dest_path);
        let run = parent.child_token();
        self.state.set_cancel_token(run.clone());

        let num_conns = self.initial_connections(file_size);
        let chunk = self.chunk_size(file_size, num_conns);
        let client = self.build_client(num_conns)?;

        if verbose {
            log::info!(
                "file size: {}, connections: {num_conns}, chunk size: {}",
                format_bytes(file_size),
                format_bytes(chunk)
            );
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&working_path)?;
        let file = Arc::new(file);

        // Saved state is consulted before touching the file, so a resume
        // never truncates partially downloaded data.
        let saved = if is_resume {
            self.store.load_state(url, dest_path).ok()
        } else {
            None
        };

        let queue = Arc::new(crate::queue::TaskQueue::new(self.runtime.min_chunk()));
        match saved {
            Some(saved) if !saved.tasks.is_empty() => {
                log::debug!(
                    "resuming from saved state: {} tasks, {} bytes downloaded",
                    saved.tasks.len(),
                    saved.downloaded
                );
                self.state.store_downloaded(saved.downloaded);
                self.state.set_saved_elapsed(saved.elapsed);
                self.state.sync_session_start();
                queue.push_multiple(saved.tasks);
            }
            _ => {
                file.set_len(file_size)?;
                self.state.store_downloaded(0);
                self.state.sync_session_start();
                queue.push_multiple(create_tasks(file_size, chunk));
            }
        }

        let run_start = Instant::now();

        // Monitors stop when the run ends, whichever way it ends.
        let monitors = run.child_token();
        let _monitor_guard = monitors.clone().drop_guard();

        tokio::spawn(balancer::run_balancer(
            Arc::clone(&self),
            Arc::clone(&queue),
            monitors.clone(),
        ));
        tokio::spawn(balancer::run_completion_monitor(
            Arc::clone(&self.state),
            Arc::clone(&queue),
            num_conns as u32,
            file_size,
            monitors.clone(),
        ));
        tokio::spawn(health::run_health_monitor(
            Arc::clone(&self),
            monitors.clone(),
        ));

        let mut workers = JoinSet::new();
        for worker_id in 0..num_conns {
            workers.spawn(worker::run_worker(
                Arc::clone(&self),
                worker_id,
                url.to_string(),
                Arc::clone(&file),
                Arc::clone(&queue),
                client.clone(),
                run.clone(),
            ));
        }

        let mut fatal: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) | Ok(Err(Error::Cancelled)) => {}
                Ok(Err(e)) => {
                    // First fatal error wins; unwind the other workers.
                    if fatal.is_none() {
                        fatal = Some(e);
                        run.cancel();
                    }
                }
                Err(join_err) => {
                    if fatal.is_none() {
                        fatal = Some(Error::Download(join_err.to_string()));
                        run.cancel();
                    }
                }
            }
        }
        queue.close();

        if self.state.is_paused() {
            return self.persist_pause(url, dest_path, file_size, run_start, &queue);
        }

        if run.is_cancelled() && fatal.is_none() {
            // Cancelled without pause: leave the .part file for the caller.
            return Err(Error::Cancelled);
        }

        if let Some(e) = fatal {
            self.state.set_error(e.to_string());
            return Err(e);
        }

        file.sync_all()?;
        drop(file);

        self.finalize_rename(&working_path, dest_path, file_size).await?;
        let _ = self
            .store
            .delete_state(Some(&self.id), url, dest_path);
        Ok(())
    }

    /// Collects outstanding work from still-registered active tasks and the
    /// queue, then persists one consistent paused snapshot.
    fn persist_pause(
        &self,
        url: &str,
        dest_path: &Path,
        file_size: u64,
        run_start: Instant,
        queue: &crate::queue::TaskQueue,
    ) -> Result<()> {
        let mut remaining: Vec<Task> = {
            let active = self.active_tasks.lock().unwrap();
            active
                .values()
                .filter_map(|at| at.remaining_task())
                .collect()
        };
        remaining.extend(queue.drain_remaining());

        let remaining_bytes: u64 = remaining.iter().map(|t| t.length).sum();
        // Derived from what is actually outstanding, so the persisted pair
        // (downloaded, tasks) is internally consistent no matter what the
        // live counter says.
        let computed_downloaded = file_size.saturating_sub(remaining_bytes);
        let total_elapsed = self.state.saved_elapsed() + run_start.elapsed();

        let mut state = DownloadState {
            id: self.id.clone(),
            url: url.to_string(),
            dest_path: dest_path.to_path_buf(),
            filename: dest_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            total_size: file_size,
            downloaded: computed_downloaded,
            tasks: remaining,
            elapsed: total_elapsed,
            url_hash: String::new(),
            created_at: 0,
            paused_at: 0,
        };

        if let Err(e) = self.store.save_state(&mut state) {
            // Partial data on disk is still salvageable on a later attempt.
            log::error!("failed to save pause state: {e}");
        } else {
            log::debug!(
                "download paused, state saved (downloaded={computed_downloaded}, tasks={})",
                state.tasks.len()
            );
        }

        Err(Error::Paused)
    }

    /// Renames the working file into place, tolerating the race where a
    /// cooperating process already did it.
    async fn finalize_rename(
        &self,
        working_path: &Path,
        dest_path: &Path,
        file_size: u64,
    ) -> Result<()> {
        match self.fs.rename(working_path, dest_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.fs.file_size(dest_path).await == Some(file_size) {
                    log::debug!(
                        "rename race: {} already present with expected size",
                        dest_path.display()
                    );
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Generates the initial task list tiling `[0, file_size)`.
fn create_tasks(file_size: u64, chunk_size: u64) -> Vec<Task> {
    if chunk_size == 0 {
        return Vec::new();
    }
    let mut tasks = Vec::new();
    let mut offset = 0;
    while offset < file_size {
        let length = chunk_size.min(file_size - offset);
        tasks.push(Task::new(offset, length));
        offset += length;
    }
    tasks
}
