use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NewGitHubClientError {
    #[error("MissingToken: a GitHub token is required")]
    MissingToken,

    #[error("BuildHttpClient: {source}")]
    BuildHttpClient {
        #[from]
        source: reqwest::Error,
    },
}

/// Errors that end a `fetch_page` call. Everything here is final for the
/// page: retryable conditions are handled inside the client.
#[derive(Debug, Error)]
pub enum FetchPageError {
    #[error("InvalidPageSize: {page_size} is outside 1..={max}")]
    InvalidPageSize { page_size: u32, max: u32 },

    #[error("Authentication: {status}: {message}")]
    Authentication { status: StatusCode, message: String },

    #[error("QueryRejected: {message}")]
    QueryRejected {
        status: Option<StatusCode>,
        message: String,
    },

    #[error("MalformedResponse: {reason}")]
    MalformedResponse { reason: String },

    #[error("RetriesExhausted: gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: String },
}

impl FetchPageError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        FetchPageError::MalformedResponse {
            reason: reason.into(),
        }
    }
}

/// Outcome of a single HTTP round trip that did not produce a page.
#[derive(Debug)]
pub(crate) enum AttemptFailure {
    RateLimited { reset_at: Option<DateTime<Utc>> },
    Transient { reason: String },
    Fatal(FetchPageError),
}

impl From<FetchPageError> for AttemptFailure {
    fn from(err: FetchPageError) -> Self {
        AttemptFailure::Fatal(err)
    }
}
