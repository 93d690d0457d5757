//! The event-loop driver. Composes the timer wheel, tick/deferred queues,
//! fiber table, socket watchers and an installed HTTP pump behind one
//! cheaply-cloneable handle. The loop is an explicit value passed into
//! clients rather than a global singleton, so every API that needs it takes
//! a `&LoopHandle` explicitly.
//!
//! `LoopInner` itself carries no outer `RefCell`: every field that needs
//! interior mutability owns its own `RefCell`/`Cell`, so a handle method
//! only ever borrows the one field it touches, for as long as that single
//! call takes. A method invoked reentrantly from inside a callback this
//! loop is currently running — a retry timer rescheduling itself, a MySQL
//! socket registering its watchers from inside the first poll of its own
//! connect future — borrows a *different* statement's guard than whatever
//! `tick()` is mid-way through, so it never collides with it. `tick()`
//! itself follows the same rule phase by phase: each phase takes its due
//! work into an owned `Vec` (a short borrow, dropped the instant it
//! returns) and only then invokes it, with no borrow outstanding.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::Token;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::RuntimeError;
use crate::fiber::{FiberId, FiberTable};
use crate::io::IoRegistry;
use crate::promise::{Promise, Resolver, Scheduler};
use crate::pump::{HttpPump, NullPump};
use crate::queues::{DeferredQueue, TickQueue};
use crate::timer::{TimerId, TimerWheel};

/// Upper bound on the loop's adaptive sleep.
pub const MAX_SLEEP: Duration = Duration::from_micros(500);
/// Below this, the loop spins rather than paying a syscall for a sleep that
/// short.
pub const MIN_SLEEP: Duration = Duration::from_micros(50);
/// Default grace period for `stop()` before `force_stop()` kicks in.
pub const DEFAULT_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(2);

struct IdleTracker {
    last_activity: Instant,
    avg_interval: f64,
    activity_count: u64,
}

impl IdleTracker {
    fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            avg_interval: 0.0,
            activity_count: 0,
        }
    }

    /// EMA of inter-activity gaps, alpha = 0.1.
    fn note_activity(&mut self, now: Instant) {
        let gap = now.saturating_duration_since(self.last_activity).as_secs_f64();
        if self.activity_count > 0 {
            self.avg_interval = 0.1 * gap + 0.9 * self.avg_interval;
        }
        self.last_activity = now;
        self.activity_count += 1;
    }

    fn is_idle(&self, now: Instant) -> bool {
        let since = now.saturating_duration_since(self.last_activity).as_secs_f64();
        let threshold = if self.activity_count >= 100 {
            (self.avg_interval * 10.0).max(1.0)
        } else {
            5.0
        };
        since > threshold
    }
}

/// Type-erased hook so `force_stop` can reject any outstanding `Resolver`
/// regardless of its value type. Populated wherever this crate creates a
/// promise meant to represent caller-visible in-flight work (`spawn_async`,
/// the combinators) — leaf crates register their own root promises the same
/// way via `LoopHandle::track_shutdown`.
trait Rejectable {
    fn reject_shutdown(&self);
    fn is_settled(&self) -> bool;
}

impl<T: Clone + 'static> Rejectable for Resolver<T, RuntimeError> {
    fn reject_shutdown(&self) {
        self.reject(RuntimeError::Shutdown);
    }

    fn is_settled(&self) -> bool {
        Resolver::is_settled(self)
    }
}

pub(crate) struct LoopInner {
    pub(crate) scheduler: Scheduler,
    deferred: RefCell<DeferredQueue>,
    timers: RefCell<TimerWheel>,
    fibers: FiberTable,
    io: RefCell<IoRegistry>,
    http_pump: RefCell<Box<dyn HttpPump>>,
    clock: Box<dyn Clock>,
    idle: RefCell<IdleTracker>,
    running: Cell<bool>,
    force_stopped: Cell<bool>,
    stop_requested_at: Cell<Option<Instant>>,
    graceful_shutdown_timeout: Cell<Duration>,
    pending: RefCell<Vec<Box<dyn Rejectable>>>,
}

/// Cheap, cloneable handle to the loop. All runtime-facing operations are
/// methods on this type.
#[derive(Clone)]
pub struct LoopHandle(Rc<LoopInner>);

impl LoopHandle {
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock))
    }

    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        let now = clock.now();
        let inner = LoopInner {
            scheduler: Rc::new(RefCell::new(TickQueue::new())),
            deferred: RefCell::new(DeferredQueue::new()),
            timers: RefCell::new(TimerWheel::new()),
            fibers: FiberTable::new(),
            io: RefCell::new(IoRegistry::new().expect("failed to initialize reactor")),
            http_pump: RefCell::new(Box::new(NullPump)),
            clock,
            idle: RefCell::new(IdleTracker::new(now)),
            running: Cell::new(false),
            force_stopped: Cell::new(false),
            stop_requested_at: Cell::new(None),
            graceful_shutdown_timeout: Cell::new(DEFAULT_GRACEFUL_SHUTDOWN),
            pending: RefCell::new(Vec::new()),
        };
        Self(Rc::new(inner))
    }

    pub fn scheduler(&self) -> Scheduler {
        self.0.scheduler.clone()
    }

    pub fn now(&self) -> Instant {
        self.0.clock.now()
    }

    pub fn set_graceful_shutdown_timeout(&self, timeout: Duration) {
        self.0.graceful_shutdown_timeout.set(timeout);
    }

    pub fn install_http_pump(&self, pump: Box<dyn HttpPump>) {
        *self.0.http_pump.borrow_mut() = pump;
    }

    pub fn add_next_tick(&self, f: impl FnOnce() + 'static) {
        self.0.scheduler.borrow_mut().push(Box::new(f));
    }

    pub fn add_deferred(&self, f: impl FnOnce() + 'static) {
        self.0.deferred.borrow_mut().push(Box::new(f));
    }

    pub fn add_timer(&self, delay: Duration, f: impl FnOnce() + 'static) -> TimerId {
        let deadline = self.0.clock.now() + delay;
        self.0.timers.borrow_mut().add(deadline, Box::new(f))
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.0.timers.borrow_mut().cancel(id);
    }

    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> FiberId {
        self.0.fibers.spawn(future)
    }

    /// Registers a root promise's resolver so `force_stop` can reject it
    /// with `RuntimeError::Shutdown` instead of leaving it permanently
    /// pending. Leaf crates (`rt-http`'s `Client::send`, `rt-pool`'s
    /// `Pool::get`) call this on the resolver backing whatever promise they
    /// hand back to their own caller; combinators in this crate do the same
    /// for theirs.
    pub fn track_shutdown<T: Clone + 'static>(&self, resolver: &Resolver<T, RuntimeError>) {
        self.0.pending.borrow_mut().push(Box::new(resolver.clone()));
    }

    /// Spawns a coroutine whose return value settles the returned promise —
    /// the Rust realization of the spawn-a-coroutine-as-a-promise-factory
    /// pattern.
    pub fn spawn_async<T: Clone + 'static>(
        &self,
        future: impl Future<Output = Result<T, RuntimeError>> + 'static,
    ) -> Promise<T, RuntimeError> {
        let (promise, resolver) = Promise::pending(&self.scheduler());
        self.track_shutdown(&resolver);
        self.spawn(async move {
            match future.await {
                Ok(v) => resolver.resolve(v),
                Err(e) => resolver.reject(e),
            }
        });
        promise
    }

    /// Grants direct access to the reactor so leaf crates (the MySQL
    /// connection, the HTTP pump) can register their own `mio` sources.
    /// Safe to call reentrantly from inside a watcher this loop is in the
    /// middle of invoking (see `poll_io`): that invocation never holds this
    /// borrow itself.
    pub fn with_io<R>(&self, f: impl FnOnce(&mut IoRegistry) -> R) -> R {
        f(&mut self.0.io.borrow_mut())
    }

    pub fn new_io_token(&self) -> Token {
        self.0.io.borrow_mut().new_token()
    }

    /// Graceful shutdown. The loop finishes its current iteration and any
    /// deferred callbacks, then keeps running while real work remains, up
    /// to `graceful_shutdown_timeout` before `force_stop()`.
    pub fn stop(&self) {
        if self.0.running.get() {
            self.0.running.set(false);
            self.0.stop_requested_at.set(Some(self.0.clock.now()));
        }
    }

    /// Immediate shutdown: every queued/scheduled/timer callback is
    /// dropped, every tracked root promise is rejected with
    /// `RuntimeError::Shutdown`, the installed HTTP pump aborts its
    /// in-flight transfers, and every suspended fiber is dropped (which, by
    /// ordinary `Drop` semantics, closes whatever socket it held open).
    /// `run_until_settled`'s caller gets `Err(RuntimeError::Shutdown)`
    /// rather than hanging forever on a promise that will now never settle
    /// on its own.
    pub fn force_stop(&self) {
        self.0.running.set(false);
        self.0.force_stopped.set(true);

        self.0.deferred.borrow_mut().clear();
        self.0.timers.borrow_mut().clear();

        let pending = std::mem::take(&mut *self.0.pending.borrow_mut());
        for rejectable in pending {
            rejectable.reject_shutdown();
        }
        self.0.scheduler.borrow_mut().clear();

        self.0.http_pump.borrow_mut().shutdown();
        self.0.io.borrow_mut().close_all();
        self.0.fibers.clear();

        warn!("event loop force-stopped; outstanding promises were rejected with RuntimeError::Shutdown");
    }

    /// One iteration: drain next-tick callbacks, advance timers, run a
    /// coroutine cycle, poll the HTTP pump, poll socket watchers, then
    /// drain the deferred queue. Every phase that can invoke a caller-
    /// supplied callback takes its due work into an owned `Vec` first and
    /// invokes it only after that borrow has already ended.
    fn tick(&self) -> bool {
        let tick_started = Instant::now();
        let mut did_work = false;

        // 1. next-tick queue, bounded batch.
        let batch = self.0.scheduler.borrow_mut().take_batch();
        if !batch.is_empty() {
            did_work = true;
            for cb in batch {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb));
                if let Err(panic) = result {
                    tracing::error!(?panic, "next-tick callback panicked");
                }
            }
        }

        // 2. advance timers.
        let now = self.0.clock.now();
        let due = self.0.timers.borrow_mut().take_due(now);
        if !due.is_empty() {
            did_work = true;
            for cb in due {
                cb();
            }
        }

        // 3. coroutine cycle: start new, then resume ready.
        if self.0.fibers.has_runnable_work() {
            self.0.fibers.process();
            did_work = true;
        }

        // 4. poll the installed HTTP pump.
        let had_in_flight = self.0.http_pump.borrow().has_in_flight();
        self.0.http_pump.borrow_mut().poll();
        if had_in_flight {
            did_work = true;
        }

        // 5. poll socket/stream watchers, zero timeout.
        match self.poll_io(Some(Duration::ZERO)) {
            Ok(n) if n > 0 => did_work = true,
            Ok(_) => {}
            Err(err) => debug!(?err, "io poll_once failed"),
        }

        // 6. drain deferred queue in one batch.
        let deferred = self.0.deferred.borrow_mut().take_all();
        if !deferred.is_empty() {
            did_work = true;
            for cb in deferred {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb));
                if let Err(panic) = result {
                    tracing::error!(?panic, "deferred callback panicked");
                }
            }
        }

        // 7. prune already-settled entries from the shutdown registry so a
        // long-running loop doesn't hold a `Resolver` per promise forever.
        self.0.pending.borrow_mut().retain(|r| !r.is_settled());

        if did_work {
            let now = self.0.clock.now();
            self.0.idle.borrow_mut().note_activity(now);
        }
        metrics::histogram!("rt_core_tick_duration_seconds").record(tick_started.elapsed().as_secs_f64());
        did_work
    }

    /// Polls the reactor and invokes ready watchers. Each step — take the
    /// ready tokens, take one watcher, invoke it, restore it — is its own
    /// short borrow of `io`, so a watcher whose invocation calls back into
    /// `with_io`/`new_io_token` (e.g. `Socket::connect`'s synchronous
    /// pre-await setup, run from inside this same tick's fiber-processing
    /// phase when the fiber that opens a new connection is first polled)
    /// never contends with a borrow this method is still holding.
    fn poll_io(&self, timeout: Option<Duration>) -> std::io::Result<usize> {
        let ready = self.0.io.borrow_mut().take_ready(timeout)?;
        let n = ready.len();
        for (token, readable, writable) in ready {
            if readable {
                if let Some(mut f) = self.0.io.borrow_mut().take_read_watcher(token) {
                    f();
                    self.0.io.borrow_mut().restore_read_watcher(token, f);
                }
            }
            if writable {
                if let Some(mut f) = self.0.io.borrow_mut().take_write_watcher(token) {
                    f();
                    self.0.io.borrow_mut().restore_write_watcher(token, f);
                }
            }
        }
        Ok(n)
    }

    fn has_runnable_now(&self) -> bool {
        !self.0.scheduler.borrow().is_empty()
            || self.0.fibers.has_runnable_work()
            || !self.0.deferred.borrow().is_empty()
    }

    /// Computes the bounded adaptive sleep: `min(MAX_SLEEP,
    /// next_timer_delay)`, skipped entirely if under `MIN_SLEEP`.
    fn sleep_budget(&self) -> Option<Duration> {
        let now = self.0.clock.now();
        let next_timer = self.0.timers.borrow_mut().next_delay(now);
        let budget = match next_timer {
            Some(d) => d.min(MAX_SLEEP),
            None => MAX_SLEEP,
        };
        if budget < MIN_SLEEP {
            None
        } else {
            Some(budget)
        }
    }

    fn has_pending_work(&self) -> bool {
        self.0.fibers.has_runnable_work()
            || !self.0.timers.borrow().is_empty()
            || self.0.http_pump.borrow().has_in_flight()
            || !self.0.deferred.borrow().is_empty()
            || !self.0.scheduler.borrow().is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.0.idle.borrow().is_idle(self.0.clock.now())
    }

    /// Drives the loop until `p` settles, returning its value or
    /// propagating its rejection. This backs the `runtime` crate's `run()`.
    /// If a callback run from within this loop calls `force_stop()` before
    /// `p` settles on its own, this returns `Err(RuntimeError::Shutdown)`
    /// rather than spinning forever on a promise nothing will ever settle
    /// again.
    pub fn run_until_settled<T: Clone + 'static>(
        &self,
        p: &Promise<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        self.0.running.set(true);
        self.0.force_stopped.set(false);
        loop {
            if let Some(result) = poll_settled(p) {
                return result;
            }
            let did_work = self.tick();
            if let Some(result) = poll_settled(p) {
                return result;
            }
            if self.0.force_stopped.get() {
                return Err(RuntimeError::Shutdown);
            }
            if !did_work && !self.has_runnable_now() {
                if let Some(budget) = self.sleep_budget() {
                    self.poll_io(Some(budget)).ok();
                }
            }
        }
    }

    /// Drives the loop indefinitely until `stop()`/`force_stop()` is called
    /// from within a scheduled callback.
    pub fn run_forever(&self) {
        self.0.running.set(true);
        self.0.force_stopped.set(false);
        loop {
            let did_work = self.tick();

            let running = self.0.running.get();
            let stop_requested_at = self.0.stop_requested_at.get();
            let timeout = self.0.graceful_shutdown_timeout.get();

            if !running {
                if let Some(requested) = stop_requested_at {
                    let elapsed = self.0.clock.now().saturating_duration_since(requested);
                    if elapsed > timeout {
                        self.force_stop();
                        return;
                    }
                }
                if !self.has_pending_work() {
                    return;
                }
            }

            if !did_work && !self.has_runnable_now() {
                if let Some(budget) = self.sleep_budget() {
                    self.poll_io(Some(budget)).ok();
                }
            }
        }
    }
}

impl Default for LoopHandle {
    fn default() -> Self {
        Self::new()
    }
}

fn poll_settled<T: Clone + 'static>(p: &Promise<T, RuntimeError>) -> Option<Result<T, RuntimeError>> {
    // `Promise` doesn't expose its state directly (it's only observable via
    // `subscribe`/`Future::poll`), so drive it through a throwaway `Waker`
    // that does nothing — we only care whether it's already `Ready`.
    use std::task::{Context, Poll};
    let waker = futures_noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut p = p.clone();
    match std::pin::Pin::new(&mut p).poll(&mut cx) {
        Poll::Ready(result) => Some(result),
        Poll::Pending => None,
    }
}

fn futures_noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        raw()
    }
    fn raw() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe { Waker::from_raw(raw()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_until_settled_drives_a_spawned_fiber_to_completion() {
        let handle = LoopHandle::new();
        let p = handle.spawn_async(async move { Ok::<_, RuntimeError>(42) });
        let result = handle.run_until_settled(&p);
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn run_until_settled_honors_a_timer() {
        let handle = LoopHandle::new();
        let scheduler = handle.scheduler();
        let (p, resolver) = Promise::<i32, RuntimeError>::pending(&scheduler);
        let h2 = handle.clone();
        handle.add_timer(Duration::from_millis(5), move || {
            let _ = &h2;
            resolver.resolve(7);
        });
        let result = handle.run_until_settled(&p);
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn a_timer_callback_can_reentrantly_schedule_another_timer() {
        // Regression test for the reentrancy panic this module's doc
        // comment describes: firing a timer used to hold the wheel's only
        // borrow for the whole `advance()` call, so a callback that itself
        // called `add_timer` (the HTTP client's retry backoff does exactly
        // this) would panic with a `BorrowMutError`.
        let handle = LoopHandle::new();
        let scheduler = handle.scheduler();
        let (p, resolver) = Promise::<i32, RuntimeError>::pending(&scheduler);
        let h2 = handle.clone();
        let resolver2 = resolver.clone();
        handle.add_timer(Duration::from_millis(1), move || {
            h2.add_timer(Duration::from_millis(1), move || {
                resolver2.resolve(99);
            });
        });
        let result = handle.run_until_settled(&p);
        assert_eq!(result.unwrap(), 99);
    }

    #[test]
    fn spawning_a_fiber_from_inside_a_fibers_first_poll_does_not_panic() {
        // Regression test for the MySQL `Socket::connect` crash this
        // module's doc comment describes: a fiber that calls `handle.
        // spawn(...)`/`handle.with_io(...)` synchronously, before its first
        // `.await`, runs that call from inside `FiberTable::process`'s own
        // poll — which used to be reached through the same outer borrow
        // `tick()` held for the whole iteration.
        let handle = LoopHandle::new();
        let h2 = handle.clone();
        let p = handle.spawn_async(async move {
            let token = h2.new_io_token();
            h2.with_io(|io| io.close_all());
            let _ = token;
            Ok::<_, RuntimeError>(1)
        });
        let result = handle.run_until_settled(&p);
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn force_stop_rejects_a_tracked_pending_promise_with_shutdown() {
        let handle = LoopHandle::new();
        let scheduler = handle.scheduler();
        let (p, resolver) = Promise::<i32, RuntimeError>::pending(&scheduler);
        handle.track_shutdown(&resolver);
        handle.force_stop();
        let result = handle.run_until_settled(&p);
        assert!(matches!(result, Err(RuntimeError::Shutdown)));
    }
}
