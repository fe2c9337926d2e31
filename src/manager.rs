//! Per-download orchestration: probe, path resolution, engine selection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::DownloadRequest;
use crate::engine::{ConcurrentDownloader, part_path};
use crate::error::Result;
use crate::events::{DownloadEvent, ProgressReporter};
use crate::fs::{FileSystem, TokioFileSystem};
use crate::probe::probe_server;
use crate::single::SingleDownloader;
use crate::store::StateStore;

/// Glue between the pool and the two download engines.
pub struct Manager {
    store: Arc<StateStore>,
    fs: Arc<dyn FileSystem>,
}

impl Manager {
    /// Creates a manager over the given store with the real file system.
    #[must_use]
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            fs: Arc::new(TokioFileSystem::new()),
        }
    }

    /// Creates a manager with a custom file system implementation.
    #[must_use]
    pub fn with_fs(store: Arc<StateStore>, fs: Arc<dyn FileSystem>) -> Self {
        Self { store, fs }
    }

    /// Runs one download to a terminal outcome: probe, resolve the
    /// destination, pick an engine, emit the bracketing events.
    ///
    /// # Errors
    ///
    /// The paused/cancelled sentinels, probe failures, or the engine's
    /// first fatal error.
    pub async fn run(&self, parent: &CancellationToken, cfg: &mut DownloadRequest) -> Result<()> {
        let probe = probe_server(
            parent,
            &cfg.url,
            cfg.filename.as_deref(),
            &cfg.runtime,
        )
        .await?;

        // Timer starts after the probe so reported elapsed covers transfer
        // only.
        let run_start = Instant::now();

        let dest_path = self.resolve_dest_path(cfg, &probe.filename).await?;
        let final_filename = dest_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| probe.filename.clone());
        cfg.filename = Some(final_filename.clone());
        cfg.dest_path = Some(dest_path.clone());
        log::debug!("destination path: {}", dest_path.display());

        cfg.emit(DownloadEvent::Started {
            id: cfg.id.clone(),
            url: cfg.url.clone(),
            filename: final_filename.clone(),
            total: probe.file_size,
            dest_path: dest_path.clone(),
            state: Arc::clone(&cfg.state),
        });

        cfg.state.set_total_size(probe.file_size);

        // The reporter is stopped (and joined) before the terminal event so
        // no Progress sample can trail Completed, Paused or Error.
        let reporter_stop = CancellationToken::new();
        let reporter_handle = cfg.events.clone().map(|events| {
            let reporter = ProgressReporter::new(Arc::clone(&cfg.state), events);
            let stop = reporter_stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = stop.cancelled() => {}
                    () = reporter.run() => {}
                }
            })
        });

        let host = Url::parse(&cfg.url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_default();

        let result = if probe.supports_range && probe.file_size > 0 {
            log::debug!("using concurrent downloader");
            let engine = Arc::new(ConcurrentDownloader::new(
                cfg.id.clone(),
                &host,
                Arc::clone(&cfg.state),
                Arc::clone(&cfg.runtime),
                Arc::clone(&self.store),
                Arc::clone(&self.fs),
            ));
            engine
                .download(
                    parent,
                    &cfg.url,
                    &dest_path,
                    probe.file_size,
                    cfg.is_resume,
                    cfg.verbose,
                )
                .await
        } else {
            log::debug!("using single-connection downloader");
            let engine = SingleDownloader::new(
                cfg.id.clone(),
                &host,
                Arc::clone(&cfg.state),
                Arc::clone(&cfg.runtime),
                Arc::clone(&self.store),
                Arc::clone(&self.fs),
            );
            engine
                .download(parent, &cfg.url, &dest_path, probe.file_size, cfg.verbose)
                .await
        };

        reporter_stop.cancel();
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if result.is_ok() && !cfg.state.is_paused() {
            cfg.emit(DownloadEvent::Completed {
                id: cfg.id.clone(),
                filename: final_filename,
                elapsed: run_start.elapsed(),
                total: probe.file_size,
            });
        }

        result
    }

    /// Resolves where the payload lands. Resumes reuse the saved path
    /// verbatim; fresh downloads join directories with the probed filename
    /// and dodge collisions with a `(n)` suffix.
    async fn resolve_dest_path(
        &self,
        cfg: &DownloadRequest,
        probed_filename: &str,
    ) -> Result<PathBuf> {
        if cfg.is_resume {
            if let Some(dest) = &cfg.dest_path {
                if let Ok(saved) = self.store.load_state(&cfg.url, dest) {
                    if !saved.tasks.is_empty() {
                        log::debug!("resuming with saved dest path: {}", saved.dest_path.display());
                        return Ok(saved.dest_path);
                    }
                }
            }
        }

        let output = &cfg.output_path;
        if !self.fs.file_exists(output).await {
            // Treat a missing output path as a directory to create, unless
            // it clearly names a file inside an existing directory.
            if output.extension().is_none() {
                self.fs.create_dir_all(output).await?;
            } else if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                self.fs.create_dir_all(parent).await?;
            }
        }

        let mut dest = if self.fs.is_dir(output).await {
            let filename = cfg
                .filename
                .as_deref()
                .filter(|f| !f.is_empty())
                .unwrap_or(probed_filename);
            output.join(filename)
        } else {
            output.clone()
        };

        if !cfg.is_resume {
            dest = self.unique_file_path(dest).await;
        }
        Ok(dest)
    }

    /// Appends `(1)`, `(2)`, ... before the extension until neither the
    /// path nor its `.part` twin exists. Continues numbering from an
    /// existing `(n)` suffix; gives up after 100 attempts and returns the
    /// original path.
    async fn unique_file_path(&self, path: PathBuf) -> PathBuf {
        if !self.occupied(&path).await {
            return path;
        }

        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (base, start) = split_counter_suffix(&stem);

        for i in 0..100u32 {
            let candidate = dir.join(format!("{base}({}){ext}", start + i));
            if !self.occupied(&candidate).await {
                return candidate;
            }
        }
        path
    }

    async fn occupied(&self, path: &Path) -> bool {
        self.fs.file_exists(path).await || self.fs.file_exists(&part_path(path)).await
    }
}

/// Splits a trailing `(n)` counter off a file stem, returning the base name
/// and the next counter to try.
fn split_counter_suffix(stem: &str) -> (&str, u32) {
    if stem.len() > 3 && stem.ends_with(')') {
        if let Some(open) = stem.rfind('(') {
            if let Ok(n) = stem[open + 1..stem.len() - 1].parse::<u32>() {
                if n > 0 {
                    return (&stem[..open], n + 1);
                }
            }
        }
    }
    (stem, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{TestServer, payload};
    use tempfile::TempDir;

    #[test]
    fn counter_suffix_parses_existing_numbers() {
        assert_eq!(split_counter_suffix("file"), ("file", 1));
        assert_eq!(split_counter_suffix("file(3)"), ("file", 4));
        assert_eq!(split_counter_suffix("file(0)"), ("file(0)", 1));
        assert_eq!(split_counter_suffix("f(x)"), ("f(x)", 1));
    }

    #[tokio::test]
    async fn unique_path_appends_counter() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::in_memory().unwrap());
        let manager = Manager::new(store);

        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"existing").unwrap();

        let unique = manager.unique_file_path(path.clone()).await;
        assert_eq!(unique, dir.path().join("report(1).pdf"));

        std::fs::write(&unique, b"existing too").unwrap();
        let next = manager.unique_file_path(path).await;
        assert_eq!(next, dir.path().join("report(2).pdf"));
    }

    #[tokio::test]
    async fn unique_path_counts_part_files_as_taken() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(StateStore::in_memory().unwrap());
        let manager = Manager::new(store);

        let path = dir.path().join("movie.mkv");
        std::fs::write(part_path(&path), b"in flight").unwrap();

        let unique = manager.unique_file_path(path).await;
        assert_eq!(unique, dir.path().join("movie(1).mkv"));
    }

    #[tokio::test]
    async fn run_emits_started_then_completed() {
        let data = payload(64 * 1024);
        let server = TestServer::spawn(data.clone()).await;
        let dir = TempDir::new().unwrap();

        let store = Arc::new(StateStore::in_memory().unwrap());
        let manager = Manager::new(store);

        let (tx, mut rx) = crate::events::channel();
        let mut cfg = DownloadRequest::new("m1", server.url("file.bin"), dir.path())
            .with_events(tx);

        let parent = CancellationToken::new();
        manager.run(&parent, &mut cfg).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, DownloadEvent::Started { ref filename, total, .. }
            if filename == "file.bin" && total == 64 * 1024));

        // Drain until the terminal event; everything in between must be
        // Progress.
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                DownloadEvent::Progress { .. } => assert!(!saw_completed),
                DownloadEvent::Completed { total, .. } => {
                    assert_eq!(total, 64 * 1024);
                    saw_completed = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_completed);

        assert_eq!(std::fs::read(dir.path().join("file.bin")).unwrap(), data);
    }

    #[tokio::test]
    async fn zero_byte_file_takes_single_path() {
        let server = TestServer::spawn(Vec::new()).await;
        let dir = TempDir::new().unwrap();

        let store = Arc::new(StateStore::in_memory().unwrap());
        let manager = Manager::new(store);

        let parent = CancellationToken::new();
        let mut cfg = DownloadRequest::new("m0", server.url("empty.bin"), dir.path());
        manager.run(&parent, &mut cfg).await.unwrap();

        let dest = dir.path().join("empty.bin");
        assert!(dest.exists());
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
        assert_eq!(cfg.state.downloaded(), 0);
    }

    #[tokio::test]
    async fn filename_hint_shapes_dest_path() {
        let data = payload(2048);
        let server = TestServer::spawn(data).await;
        let dir = TempDir::new().unwrap();

        let store = Arc::new(StateStore::in_memory().unwrap());
        let manager = Manager::new(store);

        let parent = CancellationToken::new();
        let mut cfg = DownloadRequest::new("m2", server.url("server.bin"), dir.path())
            .with_filename("hinted.bin");
        manager.run(&parent, &mut cfg).await.unwrap();

        assert!(dir.path().join("hinted.bin").exists());
        assert_eq!(cfg.filename.as_deref(), Some("hinted.bin"));
    }
}
