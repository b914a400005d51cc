//! Error types for commit_searcher.
//!
//! Errors are classified the way callers need to react to them: bad requests
//! are never retried, temporary errors may be retried a bounded number of
//! times, and cancellation is a sentinel distinct from genuine failures.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while preparing archives or running a search.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("temporary error: {0}")]
    Temporary(String),

    #[error("search canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("timed out after {millis}ms, results may be incomplete")]
    Timeout { millis: u64 },

    #[error("still fetching archive for {repo}@{commit} after {millis}ms, try again later")]
    StillFetching {
        repo: String,
        commit: String,
        millis: u64,
    },

    #[error("failed to fetch archive for {repo}@{commit}: {reason}")]
    Fetch {
        repo: String,
        commit: String,
        reason: String,
    },

    #[error("invalid archive {path}: {reason}")]
    Archive { path: PathBuf, reason: String },

    #[error("index backend error: {0}")]
    Index(String),

    #[error("structural search failed: {0}")]
    Structural(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for search operations.
pub type Result<T> = std::result::Result<T, SearchError>;

impl SearchError {
    /// Returns true if retrying the same operation may succeed.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_) | Self::StillFetching { .. })
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, Self::BadRequest(_))
    }

    /// Returns true for the cancellation sentinels.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// Returns a machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Temporary(_) => "TEMPORARY",
            Self::Canceled => "CANCELED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::StillFetching { .. } => "STILL_FETCHING",
            Self::Fetch { .. } => "FETCH_ERROR",
            Self::Archive { .. } => "ARCHIVE_ERROR",
            Self::Index(_) => "INDEX_ERROR",
            Self::Structural(_) => "STRUCTURAL_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn temporary(msg: impl Into<String>) -> Self {
        Self::Temporary(msg.into())
    }
}

impl From<regex::Error> for SearchError {
    fn from(err: regex::Error) -> Self {
        Self::BadRequest(format!("invalid regex: {}", err))
    }
}

impl From<globset::Error> for SearchError {
    fn from(err: globset::Error) -> Self {
        Self::BadRequest(format!("invalid glob: {}", err))
    }
}

impl From<zip::result::ZipError> for SearchError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive {
            path: PathBuf::new(),
            reason: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for SearchError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Io(std::io::Error::other(err.to_string()))
    }
}
