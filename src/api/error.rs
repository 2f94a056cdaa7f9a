use reqwest::StatusCode;
use thiserror::Error;

/// Errors surfaced by the request client and everything built on top of it.
///
/// Transport, status and validation failures are API-layer errors: the
/// client retries them on idempotent requests. Authorization failures are
/// never retried so downstream consumers can present a permanent fault
/// instead of a transient one.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Connection or timeout failure before a response was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx response. The message is extracted from the documented error
    /// envelope when present and travels with the error through retries.
    #[error("server replied with {status}: {message}")]
    Status { status: StatusCode, message: String },

    /// Response body did not match the expected shape.
    #[error("response validation failed: {0}")]
    Validation(String),

    /// Credentials were rejected or the authorization gate failed.
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// The request could not be built. Programming error, never retried.
    #[error("failed to build request: {0}")]
    Request(String),
}

// Statuses that are terminal regardless of method idempotency.
const NEVER_RETRY: [StatusCode; 2] = [StatusCode::NOT_FOUND, StatusCode::GONE];

impl ApiError {
    /// Whether the failure may resolve by retrying the same request.
    ///
    /// This is only half of the retry decision; the other half is method
    /// idempotency, which belongs to the request.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Transport(_) | ApiError::Validation(_) => true,
            ApiError::Status { status, .. } => !NEVER_RETRY.contains(status),
            ApiError::Authorization(_) | ApiError::Request(_) => false,
        }
    }

    /// Whether this failure means the account credentials are rejected.
    pub fn is_authorization(&self) -> bool {
        matches!(self, ApiError::Authorization(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_validation_are_retryable() {
        assert!(ApiError::Transport("connection reset".into()).is_retryable());
        assert!(ApiError::Validation("missing field".into()).is_retryable());
    }

    #[test]
    fn not_found_is_never_retryable() {
        let err = ApiError::Status {
            status: StatusCode::NOT_FOUND,
            message: "no such appliance".into(),
        };
        assert!(!err.is_retryable());

        let err = ApiError::Status {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "boom".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn authorization_is_terminal() {
        let err = ApiError::Authorization("bad token".into());
        assert!(!err.is_retryable());
        assert!(err.is_authorization());
    }
}
