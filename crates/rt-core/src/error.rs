use std::fmt;

/// Top-level error taxonomy for the runtime. Leaf crates (`rt-http`,
/// `rt-mysql`, `rt-pool`) define their own `thiserror` enums and convert
/// into this one at their public boundary, mirroring how the teacher keeps
/// `errors::ErrorMetadata`-tagged variants local to each crate and only
/// unifies under `anyhow::Error` at the call site.
#[derive(thiserror::Error, Debug, Clone)]
pub enum RuntimeError {
    /// Raised when a cancellable promise is cancelled. Not a bug: callers
    /// should usually treat this as a normal unwind path.
    #[error("cancelled")]
    Cancellation,

    /// A `timeout(p, s)` combinator's deadline passed before `p` settled.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The event loop was asked to stop and outstanding work was aborted.
    #[error("shutdown in progress")]
    Shutdown,

    /// Wraps a leaf error from `rt-http`, `rt-mysql`, or `rt-pool`.
    #[error(transparent)]
    Other(#[from] OtherError),

    /// `any()` rejects with this once every input promise has rejected.
    #[error("all {} promises were rejected", .0.len())]
    Aggregate(std::rc::Rc<Vec<RuntimeError>>),
}

/// An opaque, cloneable wrapper around `anyhow::Error` so `RuntimeError` can
/// derive `Clone` (promises fan rejection reasons out to many handlers, so
/// the reason must be cheaply shareable — see `Promise`).
#[derive(Clone)]
pub struct OtherError(pub std::rc::Rc<anyhow::Error>);

impl OtherError {
    pub fn new(err: anyhow::Error) -> Self {
        Self(std::rc::Rc::new(err))
    }
}

impl fmt::Debug for OtherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for OtherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for OtherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for RuntimeError {
    fn from(err: anyhow::Error) -> Self {
        RuntimeError::Other(OtherError::new(err))
    }
}

impl RuntimeError {
    pub fn other(msg: impl Into<String>) -> Self {
        RuntimeError::Other(OtherError::new(anyhow::anyhow!(msg.into())))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, RuntimeError::Cancellation)
    }
}
