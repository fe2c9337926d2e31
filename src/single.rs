//! Single-connection fallback for servers without range support.
//!
//! One streaming GET into the `.part` file. There is no resume on this
//! path: without ranges a partial prefix cannot be revalidated, so a pause
//! discards the working file and a later resume starts from byte zero.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{RETRY_AFTER, USER_AGENT};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::engine::part_path;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::limiter::{self, HostLimiter};
use crate::progress::ProgressState;
use crate::store::StateStore;

/// Streams a download over a single connection.
pub struct SingleDownloader {
    id: String,
    state: Arc<ProgressState>,
    runtime: Arc<RuntimeConfig>,
    store: Arc<StateStore>,
    fs: Arc<dyn FileSystem>,
    limiter: Arc<HostLimiter>,
}

impl SingleDownloader {
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
        Self {
            id: id.into(),
            state,
            runtime,
            store,
            fs,
            limiter: limiter::for_host(host),
        }
    }

    /// Downloads `url` into `dest_path + ".part"` and renames into place.
    ///
    /// # Errors
    ///
    /// [`Error::Paused`] when paused (the working file is discarded),
    /// [`Error::Cancelled`] when cancelled, transport or I/O errors
    /// otherwise.
    pub async fn download(
        &self,
        parent: &CancellationToken,
        url: &str,
        dest_path: &Path,
        file_size: u64,
        verbose: bool,
    ) -> Result<()> {
        log::debug!(
            "single-connection download: {url} -> {}",
            dest_path.display()
        );
        if verbose {
            log::info!(
                "file size: {}, single connection (no range support)",
                crate::format::format_bytes(file_size)
            );
        }

        let working_path = part_path(dest_path);
        let run = parent.child_token();
        self.state.set_cancel_token(run.clone());
        self.state.store_downloaded(0);
        self.state.sync_session_start();

        self.limiter.wait_if_blocked().await;

        let client = reqwest::Client::builder()
            .connect_timeout(crate::constants::DIAL_TIMEOUT)
            .read_timeout(crate::constants::READ_TIMEOUT)
            .build()?;

        let request = client
            .get(url)
            .header(USER_AGENT, &self.runtime.user_agent)
            .send();
        let resp = tokio::select! {
            () = run.cancelled() => return self.interrupted(&working_path).await,
            r = request => r?,
        };

        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string);
                let wait = self.limiter.handle_429(retry_after.as_deref());
                self.state.set_rate_limited_until(SystemTime::now() + wait);
                return Err(Error::RateLimited);
            }
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
            status => return Err(Error::UnexpectedStatus(status.as_u16())),
        }
        self.limiter.report_success();

        let mut file = tokio::fs::File::create(&working_path).await?;
        let mut stream = resp.bytes_stream();

        loop {
            let next = tokio::select! {
                () = run.cancelled() => {
                    drop(file);
                    return self.interrupted(&working_path).await;
                }
                c = stream.next() => c,
            };
            match next {
                Some(Ok(chunk)) => {
                    file.write_all(&chunk).await?;
                    self.state.add_downloaded(chunk.len() as u64);
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let written = self.state.downloaded();
        if file_size > 0 && written != file_size {
            return Err(Error::Download(format!(
                "size mismatch: expected {file_size}, wrote {written}"
            )));
        }

        self.finalize_rename(&working_path, dest_path, written).await?;
        let _ = self.store.delete_state(Some(&self.id), url, dest_path);
        Ok(())
    }

    /// A pause on this path cannot be resumed, so the working file goes;
    /// a plain cancel leaves it for the caller to reap.
    async fn interrupted(&self, working_path: &Path) -> Result<()> {
        if self.state.is_paused() {
            let _ = self.fs.remove_file(working_path).await;
            return Err(Error::Paused);
        }
        Err(Error::Cancelled)
    }

    async fn finalize_rename(
        &self,
        working_path: &Path,
        dest_path: &Path,
        expected_size: u64,
    ) -> Result<()> {
        match self.fs.rename(working_path, dest_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.fs.file_size(dest_path).await == Some(expected_size) {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::TokioFileSystem;
    use crate::testutil::{TestServer, payload};
    use tempfile::TempDir;

    fn downloader(state: &Arc<ProgressState>) -> SingleDownloader {
        SingleDownloader::new(
            "dl-single",
            "localhost",
            Arc::clone(state),
            Arc::new(RuntimeConfig::default()),
            Arc::new(StateStore::in_memory().unwrap()),
            Arc::new(TokioFileSystem::new()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streams_whole_body_and_renames() {
        let data = payload(256 * 1024);
        let server = TestServer::spawn(data.clone()).await.ignore_ranges();
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.bin");

        let state = Arc::new(ProgressState::new("dl-single"));
        let d = downloader(&state);
        let parent = CancellationToken::new();

        d.download(&parent, &server.url("out.bin"), &dest, data.len() as u64, false)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(!part_path(&dest).exists());
        assert_eq!(state.downloaded(), data.len() as u64);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_size_still_completes() {
        let data = payload(4096);
        let server = TestServer::spawn(data.clone()).await.ignore_ranges();
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("unknown.bin");

        let state = Arc::new(ProgressState::new("dl-single"));
        let d = downloader(&state);
        let parent = CancellationToken::new();

        // file_size = 0 means "unknown": no size verification.
        d.download(&parent, &server.url("unknown.bin"), &dest, 0, false)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pause_discards_working_file() {
        let data = payload(4 * 1024 * 1024);
        let server = TestServer::spawn(data)
            .await
            .ignore_ranges()
            .with_chunk_delay(std::time::Duration::from_millis(30));
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("paused.bin");

        let state = Arc::new(ProgressState::new("dl-single"));
        let d = downloader(&state);
        let parent = CancellationToken::new();

        let state2 = Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(80)).await;
            state2.pause();
        });

        let err = d
            .download(&parent, &server.url("paused.bin"), &dest, 0, false)
            .await
            .unwrap_err();
        assert!(err.is_paused());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
