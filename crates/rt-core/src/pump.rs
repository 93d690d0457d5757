//! The seam `rt-http`'s transfer pump plugs into, so `rt-core` never depends
//! on `rt-http`. The driver owns at most one installed pump and calls
//! `poll()` once per iteration.

pub trait HttpPump {
    /// One non-blocking multi-perform pass. Implementations invoke their own
    /// completion callbacks (scheduled on next tick) for any transfer that
    /// finished during this call.
    fn poll(&mut self);

    /// Whether any transfer is currently in flight — used by idle detection
    /// so the loop doesn't report idle while requests are outstanding.
    fn has_in_flight(&self) -> bool;

    /// Aborts every in-flight transfer without invoking its completion
    /// callback. Called by `force_stop`; default no-op so implementations
    /// with nothing to abort (like `NullPump`) don't need to override it.
    fn shutdown(&mut self) {}
}

/// Installed by default; a no-op so `Loop::new()` doesn't require an HTTP
/// stack to exist.
pub struct NullPump;

impl HttpPump for NullPump {
    fn poll(&mut self) {}
    fn has_in_flight(&self) -> bool {
        false
    }
}
