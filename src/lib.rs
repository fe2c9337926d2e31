//! surge - a multi-connection file download engine.
//!
//! Given a URL, a destination and a set of runtime knobs, surge retrieves
//! the remote file as fast as the server and the link allow: a probe picks
//! between the chunked multi-connection engine and a single-stream
//! fallback, a balancer steals work for idle connections, a health monitor
//! recycles slow ones, and every pause is persisted so downloads resume
//! exactly where they stopped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use surge::{DownloadRequest, StateStore, WorkerPool};
//!
//! # async fn example() -> surge::Result<()> {
//! let (events, mut rx) = surge::events::channel();
//! let store = Arc::new(StateStore::open_default()?);
//! let pool = WorkerPool::new(events.clone(), store, 3);
//!
//! let request = DownloadRequest::new(
//!     "dl-1",
//!     "https://example.com/large-file.iso",
//!     "/home/me/Downloads",
//! )
//! .with_events(events);
//! pool.add(request).await;
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod filename;
pub mod format;
pub mod fs;
pub mod limiter;
pub mod manager;
pub mod pool;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod single;
pub mod store;
pub mod task;

#[cfg(test)]
mod testutil;

// Re-export the main types for convenience.
pub use config::{DownloadRequest, RuntimeConfig};
pub use engine::ConcurrentDownloader;
pub use error::{Error, Result};
pub use events::{DownloadEvent, EventReceiver, EventSender};
pub use manager::Manager;
pub use pool::{DownloadSnapshot, WorkerPool};
pub use probe::{ProbeResult, probe_server};
pub use progress::{Progress, ProgressState};
pub use single::SingleDownloader;
pub use store::{DownloadEntry, DownloadState, DownloadStatus, StateStore};
pub use task::Task;
