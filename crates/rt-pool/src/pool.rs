//! `Pool<M>`: lease/release with a bounded size and a FIFO waiter queue,
//! adapted from bb8's `Pool`/`PoolInner` split to `Rc`/`RefCell` plus
//! `rt_core::promise` instead of `tokio::sync::Mutex` + `oneshot`.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ops::Deref;
use std::rc::Rc;

use rt_core::{LoopHandle, Promise, Resolver, RuntimeError};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::manager::ManageConnection;

struct PooledInner<M: ManageConnection> {
    pool: Rc<Pool<M>>,
    conn: Option<M::Connection>,
}

impl<M: ManageConnection> Drop for PooledInner<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// A leased connection. Cheaply `Clone` (an `Rc` around the real
/// connection); the connection returns to the pool's idle queue — or
/// straight to the oldest waiter — when the last clone is dropped.
pub struct PooledConnection<M: ManageConnection> {
    inner: Rc<PooledInner<M>>,
}

impl<M: ManageConnection> Clone for PooledConnection<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.inner.conn.as_ref().expect("connection taken only by Drop")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolState {
    pub connections: u32,
    pub idle: u32,
    pub waiters: u32,
}

/// Bounded pool of `M::Connection`s. `|idle| + |leased| <= max_size` is the
/// core invariant; `get()` hands out the most recently released idle
/// connection first (LIFO — keeps a hot, short tail of idle connections
/// under bursty load instead of round-robining through all of them), opens
/// a new one under the cap, or queues behind existing waiters in FIFO order.
pub struct Pool<M: ManageConnection> {
    manager: M,
    handle: LoopHandle,
    config: PoolConfig,
    idle: RefCell<VecDeque<M::Connection>>,
    num_conns: Cell<u32>,
    waiters: RefCell<VecDeque<Resolver<PooledConnection<M>, RuntimeError>>>,
    closing: Cell<bool>,
}

impl<M: ManageConnection> Pool<M> {
    pub fn new(handle: LoopHandle, manager: M, config: PoolConfig) -> Result<Rc<Self>, PoolError> {
        config.validate()?;
        Ok(Rc::new(Self {
            manager,
            handle,
            config,
            idle: RefCell::new(VecDeque::new()),
            num_conns: Cell::new(0),
            waiters: RefCell::new(VecDeque::new()),
            closing: Cell::new(false),
        }))
    }

    /// Eagerly opens `min_idle` connections so the first `min_idle` callers
    /// never pay the connect latency.
    pub fn warm_up(self: &Rc<Self>) {
        for _ in 0..self.config.min_idle {
            if self.num_conns.get() >= self.config.max_size {
                break;
            }
            self.num_conns.set(self.num_conns.get() + 1);
            let pool = self.clone();
            self.handle.spawn(async move {
                match pool.manager.connect().await {
                    Ok(conn) => pool.release(conn),
                    Err(e) => {
                        tracing::warn!(error = %e, "pool warm-up connection failed");
                        pool.num_conns.set(pool.num_conns.get().saturating_sub(1));
                    }
                }
            });
        }
    }

    pub fn get(self: &Rc<Self>) -> Promise<PooledConnection<M>, RuntimeError> {
        let scheduler = self.handle.scheduler();

        if self.closing.get() {
            return Promise::rejected(&scheduler, PoolError::PoolClosing.into());
        }

        if !self.idle.borrow().is_empty() {
            let (promise, resolver) = Promise::pending(&scheduler);
            self.handle.track_shutdown(&resolver);
            let pool = self.clone();
            self.handle.spawn(async move { pool.acquire_idle(resolver).await });
            return promise;
        }

        let (promise, resolver) = Promise::pending(&scheduler);
        self.handle.track_shutdown(&resolver);
        self.open_or_queue(resolver);
        promise
    }

    /// Pops idle connections newest-first, discarding any that fail
    /// `ManageConnection::is_valid` (e.g. the server closed a connection
    /// that sat idle past its timeout) and shrinking `num_conns`
    /// accordingly, until a live one is found. Falls back to opening a
    /// fresh connection under the cap, or queuing behind waiters, once the
    /// idle set is exhausted.
    async fn acquire_idle(self: Rc<Self>, resolver: Resolver<PooledConnection<M>, RuntimeError>) {
        while let Some(conn) = self.idle.borrow_mut().pop_back() {
            metrics::gauge!("rt_pool_idle_connections").decrement(1.0);
            match self.manager.is_valid(&conn).await {
                Ok(()) => {
                    resolver.resolve(self.wrap(conn));
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "discarding idle connection that failed liveness check");
                    self.num_conns.set(self.num_conns.get().saturating_sub(1));
                }
            }
        }
        self.open_or_queue(resolver);
    }

    fn open_or_queue(self: &Rc<Self>, resolver: Resolver<PooledConnection<M>, RuntimeError>) {
        if self.num_conns.get() < self.config.max_size {
            self.num_conns.set(self.num_conns.get() + 1);
            let pool = self.clone();
            self.handle.spawn(async move {
                match pool.manager.connect().await {
                    Ok(conn) => {
                        metrics::gauge!("rt_pool_total_connections").increment(1.0);
                        resolver.resolve(pool.wrap(conn));
                    }
                    Err(e) => {
                        pool.num_conns.set(pool.num_conns.get().saturating_sub(1));
                        resolver.reject(PoolError::ConnectionFailed(e.to_string()).into());
                    }
                }
            });
            return;
        }

        tracing::debug!("pool at capacity, queuing waiter");
        self.waiters.borrow_mut().push_back(resolver);
        metrics::gauge!("rt_pool_waiters").increment(1.0);
    }

    fn wrap(self: &Rc<Self>, conn: M::Connection) -> PooledConnection<M> {
        PooledConnection {
            inner: Rc::new(PooledInner {
                pool: self.clone(),
                conn: Some(conn),
            }),
        }
    }

    fn release(self: &Rc<Self>, conn: M::Connection) {
        if let Some(resolver) = self.waiters.borrow_mut().pop_front() {
            metrics::gauge!("rt_pool_waiters").decrement(1.0);
            resolver.resolve(self.wrap(conn));
            return;
        }
        if self.closing.get() {
            self.num_conns.set(self.num_conns.get().saturating_sub(1));
            return;
        }
        self.idle.borrow_mut().push_back(conn);
        metrics::gauge!("rt_pool_idle_connections").increment(1.0);
    }

    /// Stops handing out new connections and rejects every queued waiter
    /// with `PoolClosing`. Idle connections are simply dropped; in-flight
    /// leases still release normally (back into a pool that no longer
    /// queues them as idle, per `release`'s `closing` check).
    pub fn close(self: &Rc<Self>) {
        self.closing.set(true);
        let dropped = self.idle.borrow_mut().drain(..).count();
        self.num_conns.set(self.num_conns.get().saturating_sub(dropped as u32));
        for resolver in self.waiters.borrow_mut().drain(..) {
            resolver.reject(PoolError::PoolClosing.into());
        }
        tracing::info!("pool closed");
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            connections: self.num_conns.get(),
            idle: self.idle.borrow().len() as u32,
            waiters: self.waiters.borrow().len() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rt_core::LoopHandle;
    use std::cell::RefCell as StdRefCell;

    #[derive(Clone)]
    struct CountingConn(u32);

    struct FakeManager {
        next_id: StdRefCell<u32>,
        fail_after: Option<u32>,
    }

    #[derive(Clone, Debug)]
    struct FakeError(String);
    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[async_trait(?Send)]
    impl ManageConnection for FakeManager {
        type Connection = CountingConn;
        type Error = FakeError;

        async fn connect(&self) -> Result<Self::Connection, Self::Error> {
            if let Some(limit) = self.fail_after {
                if *self.next_id.borrow() >= limit {
                    return Err(FakeError("connect limit reached".to_string()));
                }
            }
            let mut id = self.next_id.borrow_mut();
            *id += 1;
            Ok(CountingConn(*id))
        }

        async fn is_valid(&self, _conn: &Self::Connection) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    fn manager() -> FakeManager {
        FakeManager {
            next_id: StdRefCell::new(0),
            fail_after: None,
        }
    }

    #[test]
    fn reuses_a_released_connection_instead_of_opening_a_new_one() {
        let handle = LoopHandle::new();
        let pool = Pool::new(handle.clone(), manager(), PoolConfig { max_size: 2, ..Default::default() }).unwrap();

        let got = handle.spawn_async({
            let pool = pool.clone();
            async move {
                let first = pool.get().await?;
                let first_id = first.0;
                drop(first);
                let second = pool.get().await?;
                Ok(first_id == second.0)
            }
        });

        assert!(handle.run_until_settled(&got).unwrap());
        assert_eq!(pool.state().connections, 1);
    }

    #[test]
    fn queues_waiters_once_at_capacity() {
        let handle = LoopHandle::new();
        let pool = Pool::new(handle.clone(), manager(), PoolConfig { max_size: 1, ..Default::default() }).unwrap();

        let first = pool.get();
        handle.run_until_settled(&first).unwrap();

        let waiter = pool.get();
        assert_eq!(pool.state().waiters, 1);

        drop(first);
        let result = handle.run_until_settled(&waiter);
        assert!(result.is_ok());
        assert_eq!(pool.state().waiters, 0);
    }

    #[test]
    fn close_rejects_queued_waiters() {
        let handle = LoopHandle::new();
        let pool = Pool::new(handle.clone(), manager(), PoolConfig { max_size: 1, ..Default::default() }).unwrap();

        let first = pool.get();
        handle.run_until_settled(&first).unwrap();
        let waiter = pool.get();

        pool.close();
        let result = handle.run_until_settled(&waiter);
        assert!(result.is_err());
    }
}
