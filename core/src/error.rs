//! Error taxonomy shared by the store, replay and ingest paths.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A filter predicate that the query engine refused. User-correctable.
    #[error("invalid filter predicate `{predicate}`: {cause}")]
    InvalidQuery { predicate: String, cause: String },

    /// A request or ingest payload with the wrong shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Unknown flow id, unknown or expired replay token, or an uncaptured body.
    #[error("{0} not found")]
    NotFound(String),

    /// I/O failure against the flow archive. Never retried at this layer.
    #[error("storage fault: {0:#}")]
    Storage(#[from] anyhow::Error),

    /// Repeat/replay fetch failed, timed out or returned malformed data.
    #[error("upstream fault: {0}")]
    Upstream(String),
}

impl CoreError {
    pub fn invalid_query(predicate: &str, cause: impl ToString) -> Self {
        Self::InvalidQuery {
            predicate: predicate.to_string(),
            cause: cause.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// HTTP status used when the error crosses the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::InvalidQuery { .. } | CoreError::InvalidPayload(_) => 400,
            CoreError::NotFound(_) => 404,
            CoreError::Storage(_) => 500,
            CoreError::Upstream(_) => 502,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage(anyhow::Error::new(err))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoreError::Upstream(format!("upstream timed out: {err}"))
        } else {
            CoreError::Upstream(err.to_string())
        }
    }
}
