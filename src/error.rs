//! Error types for the surge library.

use thiserror::Error;

/// Errors that can occur during download operations.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State database error.
    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The probe could not determine server capabilities.
    #[error("probe failed: {0}")]
    Probe(String),

    /// A task request returned a status the engine cannot use.
    #[error("unexpected status: {0}")]
    UnexpectedStatus(u16),

    /// The server answered 429; the per-host limiter decides the wait.
    #[error("rate limited (429)")]
    RateLimited,

    /// The URL could not be parsed or is not HTTP(S).
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// No saved state exists for the requested (url, dest_path).
    #[error("state not found")]
    StateNotFound,

    /// Sentinel: the run ended because the download was paused. State has
    /// been persisted; this is not a failure.
    #[error("download paused")]
    Paused,

    /// Sentinel: the run was cancelled without pausing. The `.part` file is
    /// left for the caller to reap.
    #[error("download cancelled")]
    Cancelled,

    /// Download operation failed.
    #[error("download failed: {0}")]
    Download(String),
}

impl Error {
    /// Returns true for the pause sentinel, which callers must not treat as
    /// a failure.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        matches!(self, Self::Paused)
    }
}

/// A specialized `Result` type for surge operations.
pub type Result<T> = std::result::Result<T, Error>;
