use thiserror::Error;

/// Leaf error taxonomy for the pool, same split as `rt-http::HttpError` and
/// `rt-mysql::MySqlError`.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("pool is closing")]
    PoolClosing,

    #[error("timed out waiting for a connection after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to establish a pooled connection: {0}")]
    ConnectionFailed(String),

    #[error("invalid pool config: {0}")]
    InvalidConfig(String),
}

impl From<PoolError> for rt_core::RuntimeError {
    fn from(err: PoolError) -> Self {
        rt_core::RuntimeError::other(err.to_string())
    }
}
