use std::time::Duration;

use thiserror::Error;

/// Leaf error taxonomy for the HTTP client. Converted into `RuntimeError` at
/// the crate boundary (`client::Client` methods), mirroring how the leaf
/// crates keep their own `thiserror` enum and only unify under the runtime's
/// error type at the public surface.
#[derive(Error, Debug, Clone)]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http status {status}")]
    Status { status: u16 },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed after {attempts} attempts: {cause}")]
    RetriesExhausted { attempts: u32, cause: String },

    #[error("cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(String),
}

impl HttpError {
    /// Transport-level faults (DNS, connect/SSL/read/write timeouts,
    /// connection refused/reset) are the only class retried automatically;
    /// everything else (bad URL, cancellation) is surfaced immediately.
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, HttpError::Transport(_) | HttpError::Timeout(_))
    }
}

impl From<HttpError> for rt_core::RuntimeError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Cancelled => rt_core::RuntimeError::Cancellation,
            HttpError::Timeout(d) => rt_core::RuntimeError::Timeout(d),
            other => rt_core::RuntimeError::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_timeout_are_retryable_transport_faults() {
        assert!(HttpError::Transport("connection refused".into()).is_retryable_transport());
        assert!(HttpError::Timeout(Duration::from_secs(1)).is_retryable_transport());
    }

    #[test]
    fn status_cancelled_and_invalid_url_are_not_retryable_transport_faults() {
        assert!(!HttpError::Status { status: 500 }.is_retryable_transport());
        assert!(!HttpError::Cancelled.is_retryable_transport());
        assert!(!HttpError::InvalidUrl("not a url".into()).is_retryable_transport());
    }

    #[test]
    fn cancelled_and_timeout_map_to_their_runtime_counterparts() {
        assert!(matches!(
            rt_core::RuntimeError::from(HttpError::Cancelled),
            rt_core::RuntimeError::Cancellation
        ));
        assert!(matches!(
            rt_core::RuntimeError::from(HttpError::Timeout(Duration::from_secs(2))),
            rt_core::RuntimeError::Timeout(d) if d == Duration::from_secs(2)
        ));
    }

    #[test]
    fn everything_else_collapses_into_an_other_runtime_error() {
        let err = rt_core::RuntimeError::from(HttpError::Status { status: 404 });
        assert_eq!(err.to_string(), HttpError::Status { status: 404 }.to_string());
    }
}
