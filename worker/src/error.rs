use reqwest::StatusCode;
use thiserror::Error;

use crate::cancel::Cancelled;

/// Failure talking to an upstream market-data provider.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,
    #[error("{provider} returned status {status}")]
    Upstream {
        provider: &'static str,
        status: StatusCode,
    },
    #[error("failed to decode {provider} response: {message}")]
    Decode {
        provider: &'static str,
        message: String,
    },
    #[error("unexpected {provider} payload: {message}")]
    InvalidFormat {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} request failed: {source}")]
    Transport {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

impl From<Cancelled> for FetchError {
    fn from(_: Cancelled) -> Self {
        FetchError::Cancelled
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Run-level failure; per-item failures never surface here.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("run cancelled")]
    Cancelled,
    #[error("run timed out")]
    TimedOut,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl From<Cancelled> for JobError {
    fn from(_: Cancelled) -> Self {
        JobError::Cancelled
    }
}
