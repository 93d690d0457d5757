//! Top-level facade: owns the event loop and installs the HTTP pump, then
//! exposes the `run`/`run_all`/`run_concurrent`/`run_with_timeout`/
//! `run_batch` surface the rest of this workspace is built against.

use std::time::Duration;

use rt_core::{all, batch, concurrent, timeout};

pub use rt_core::{LoopHandle, Promise, Resolver, RuntimeError, Task};
pub use rt_http::{Client, ClientConfig};
pub use rt_mysql::{ConnectOptions, DatabaseConfig, MySqlConnection};
pub use rt_pool::{ManageConnection, MySqlConnectionManager, Pool, PoolConfig, PooledConnection};

/// Installs a `tracing_subscriber::fmt` layer honoring `RUST_LOG`. Optional:
/// embedders with their own subscriber can skip this and install their own.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Owns the single `LoopHandle` for a process and installs the `curl`-based
/// HTTP pump into it, so `rt_http::Client`s created against this handle get
/// a working transport with no further setup.
pub struct Runtime {
    handle: LoopHandle,
    pump: rt_http::Pump,
}

impl Runtime {
    pub fn new() -> Self {
        let handle = LoopHandle::new();
        let pump = rt_http::Pump::new();
        handle.install_http_pump(pump.as_loop_pump());
        Self { handle, pump }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn http_client(&self, config: ClientConfig) -> Client {
        Client::new(self.handle.clone(), self.pump.clone(), config)
    }

    /// Drives the loop until `op` settles; the Rust realization of the
    /// spec's `run(op)`.
    pub fn run<T: Clone + 'static>(&self, op: Promise<T, RuntimeError>) -> Result<T, RuntimeError> {
        self.handle.run_until_settled(&op)
    }

    pub fn run_all<T: Clone + 'static>(
        &self,
        ops: Vec<Promise<T, RuntimeError>>,
    ) -> Result<Vec<T>, RuntimeError> {
        self.run(all(&self.handle, ops))
    }

    pub fn run_concurrent<T: Clone + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        concurrency: usize,
    ) -> Result<Vec<T>, RuntimeError> {
        self.run(concurrent(&self.handle, tasks, concurrency))
    }

    pub fn run_with_timeout<T: Clone + 'static>(
        &self,
        op: Promise<T, RuntimeError>,
        seconds: f64,
    ) -> Result<T, RuntimeError> {
        self.run(timeout(&self.handle, op, Duration::from_secs_f64(seconds)))
    }

    pub fn run_batch<T: Clone + 'static>(
        &self,
        tasks: Vec<Task<T>>,
        batch_size: usize,
        concurrency: Option<usize>,
    ) -> Result<Vec<T>, RuntimeError> {
        self.run(batch(&self.handle, tasks, batch_size, concurrency))
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_drives_a_spawned_coroutine_to_completion() {
        let rt = Runtime::new();
        let p: Promise<i32, RuntimeError> = rt.handle.spawn_async(async { Ok(1 + 1) });
        assert_eq!(rt.run(p).unwrap(), 2);
    }

    #[test]
    fn run_with_timeout_rejects_a_promise_that_never_settles() {
        let rt = Runtime::new();
        let (p, _resolver): (Promise<i32, RuntimeError>, Resolver<i32, RuntimeError>) =
            Promise::pending(&rt.handle.scheduler());
        let result = rt.run_with_timeout(p, 0.01);
        assert!(matches!(result, Err(RuntimeError::Timeout(_))));
    }
}
