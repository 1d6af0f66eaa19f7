//! Error taxonomy for the archival engine.
//!
//! Only [`ArchiveError::Auth`], [`ArchiveError::Config`], [`ArchiveError::Cancelled`]
//! and [`ArchiveError::SessionStore`] end a run. Every other error is folded into
//! the run outcome by the crawl driver.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Session-level authentication failures.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthError {
    #[error("not authenticated")]
    Unauthenticated,

    #[error("session expired")]
    Expired,
}

/// Failures while retrieving a single resource.
#[derive(thiserror::Error, Debug)]
pub enum RetrievalError {
    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("host not allowed: {0}")]
    HostNotAllowed(String),

    /// The request was redirected to the login page.
    #[error("redirected to the login page, session expired")]
    SessionExpired,

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrievalError {
    /// Whether the driver may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            RetrievalError::Http { status, .. } => *status >= 500 || *status == 429,
            RetrievalError::Transport(_)
            | RetrievalError::Render(_)
            | RetrievalError::DeadlineExceeded(_) => true,
            RetrievalError::HostNotAllowed(_)
            | RetrievalError::SessionExpired
            | RetrievalError::Cancelled
            | RetrievalError::Io(_) => false,
        }
    }
}

/// All errors the engine can produce.
#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("navigation to {location} failed: {cause}")]
    Navigation { location: String, cause: String },

    #[error("could not resolve {resource}: {cause}")]
    Resolution { resource: String, cause: String },

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error("session store failure: {0}")]
    SessionStore(String),

    #[error("cancelled by operator")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArchiveError {
    pub fn config(msg: impl Into<String>) -> Self {
        ArchiveError::Config(msg.into())
    }

    pub fn navigation(location: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        ArchiveError::Navigation {
            location: location.into(),
            cause: cause.to_string(),
        }
    }

    /// Errors that abort the whole run instead of a single node or resource.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArchiveError::Auth(_)
                | ArchiveError::Config(_)
                | ArchiveError::Cancelled
                | ArchiveError::SessionStore(_)
        )
    }
}

/// Convenience result type.
pub type ArchiveResult<T> = Result<T, ArchiveError>;
