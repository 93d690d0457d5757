use thiserror::Error;

/// Leaf error taxonomy for the MySQL client. Converted into `RuntimeError`
/// at the crate boundary, same split as `rt-http::error::HttpError`.
#[derive(Error, Debug, Clone)]
pub enum MySqlError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(String),

    #[error("statement handle used after close")]
    StatementClosed,

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<std::io::Error> for MySqlError {
    fn from(err: std::io::Error) -> Self {
        MySqlError::Io(err.to_string())
    }
}

impl From<MySqlError> for rt_core::RuntimeError {
    fn from(err: MySqlError) -> Self {
        rt_core::RuntimeError::other(err.to_string())
    }
}
