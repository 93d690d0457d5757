//! The coroutine ("fiber") manager.
//!
//! A fiber here is an ordinary Rust `async` block polled by our own
//! single-threaded executor, rather than a hand-rolled stackful trampoline —
//! the compiler's own generator transform already produces the suspension
//! points a stackful fiber would need. `spawn`/`spawn_async` box the future;
//! awaiting is literal Rust `.await` on a `Promise`, which already
//! implements `Future` (see `promise.rs`).
//!
//! Every field is individually interior-mutable (`RefCell`/`Cell`) rather
//! than the table itself sitting behind one outer `RefCell`, so that a
//! coroutine which calls back into `spawn()` from inside its own poll (e.g.
//! a pool warming up more connections) only ever takes a short, non-
//! overlapping borrow — it never contends with the borrow `process()` is
//! itself holding while driving that same poll.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub type FiberId = u64;

type BoxedFuture = Pin<Box<dyn Future<Output = ()>>>;

struct Task {
    future: RefCell<Option<BoxedFuture>>,
    id: FiberId,
    ready: Rc<RefCell<VecDeque<FiberId>>>,
}

/// Tracks `new`, `ready`, and `suspended` fibers. A fiber moves New ->
/// Running -> (Suspended <-> Running)* -> Terminated; `Running` is implicit
/// (a fiber is "running" only for the duration of the `poll()` call inside
/// `process()`).
pub struct FiberTable {
    slots: RefCell<std::collections::HashMap<FiberId, Rc<Task>>>,
    new: RefCell<Vec<FiberId>>,
    ready: Rc<RefCell<VecDeque<FiberId>>>,
    next_id: Cell<FiberId>,
}

impl Default for FiberTable {
    fn default() -> Self {
        Self {
            slots: RefCell::new(std::collections::HashMap::new()),
            new: RefCell::new(Vec::new()),
            ready: Rc::new(RefCell::new(VecDeque::new())),
            next_id: Cell::new(0),
        }
    }
}

impl FiberTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a new fiber (`spawn`). It starts on the *next* call to
    /// `process()`, not synchronously. Safe to call reentrantly from inside
    /// a fiber currently being polled by `process()`.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> FiberId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let task = Rc::new(Task {
            future: RefCell::new(Some(Box::pin(future))),
            id,
            ready: self.ready.clone(),
        });
        self.slots.borrow_mut().insert(id, task);
        self.new.borrow_mut().push(id);
        id
    }

    pub fn has_runnable_work(&self) -> bool {
        !self.new.borrow().is_empty() || !self.ready.borrow().is_empty()
    }

    /// One coroutine-manager cycle: start every fiber in `new` exactly
    /// once, then resume every fiber currently in `ready` exactly once. A
    /// fiber that re-suspends simply leaves no trace in either list until
    /// its promise wakes it again; a fiber that returns `Ready(())` is
    /// terminated and its slot is dropped.
    pub fn process(&self) {
        let starting: Vec<FiberId> = std::mem::take(&mut *self.new.borrow_mut());
        for id in starting {
            self.poll_one(id);
        }

        let ready_now: Vec<FiberId> = self.ready.borrow_mut().drain(..).collect();
        for id in ready_now {
            self.poll_one(id);
        }
    }

    fn poll_one(&self, id: FiberId) {
        let Some(task) = self.slots.borrow().get(&id).cloned() else {
            // Already terminated (e.g. woken twice in the same cycle).
            return;
        };
        let mut fut_slot = task.future.borrow_mut();
        let Some(mut fut) = fut_slot.take() else {
            return;
        };
        let waker = waker_for(task.clone());
        let mut cx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                drop(fut_slot);
                self.slots.borrow_mut().remove(&id);
            }
            Poll::Pending => {
                *fut_slot = Some(fut);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Drops every fiber's future without polling it again, abandoning
    /// whatever it was suspended on. Anything the future owned on its stack
    /// (a `Socket`, a `PooledConnection`) runs its own `Drop` as a result —
    /// used by `force_stop` to actually close sockets rather than merely
    /// stop scheduling work.
    pub fn clear(&self) {
        self.slots.borrow_mut().clear();
        self.new.borrow_mut().clear();
        self.ready.borrow_mut().clear();
    }
}

fn waker_for(task: Rc<Task>) -> Waker {
    unsafe fn clone(ptr: *const ()) -> RawWaker {
        let task = Rc::from_raw(ptr as *const Task);
        std::mem::forget(task.clone());
        std::mem::forget(task);
        RawWaker::new(ptr, &VTABLE)
    }
    unsafe fn wake(ptr: *const ()) {
        let task = Rc::from_raw(ptr as *const Task);
        task.ready.borrow_mut().push_back(task.id);
    }
    unsafe fn wake_by_ref(ptr: *const ()) {
        let task = Rc::from_raw(ptr as *const Task);
        task.ready.borrow_mut().push_back(task.id);
        std::mem::forget(task);
    }
    unsafe fn drop_fn(ptr: *const ()) {
        drop(Rc::from_raw(ptr as *const Task));
    }

    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_fn);

    let raw = RawWaker::new(Rc::into_raw(task) as *const (), &VTABLE);
    unsafe { Waker::from_raw(raw) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;

    #[test]
    fn spawned_fiber_starts_on_next_process_not_immediately() {
        let table = FiberTable::new();
        let ran = Rc::new(StdCell::new(false));
        let ran2 = ran.clone();
        table.spawn(async move {
            ran2.set(true);
        });
        assert!(!ran.get());
        table.process();
        assert!(ran.get());
        assert!(table.is_empty());
    }

    #[test]
    fn terminated_fiber_frees_its_slot() {
        let table = FiberTable::new();
        table.spawn(async move {});
        table.process();
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn spawn_called_reentrantly_during_process_is_picked_up_next_cycle() {
        let table = Rc::new(FiberTable::new());
        let inner_ran = Rc::new(StdCell::new(false));

        let table2 = table.clone();
        let inner_ran2 = inner_ran.clone();
        table.spawn(async move {
            // Simulates a coroutine that spawns more work synchronously
            // before its first await, the same shape `Pool::warm_up` uses.
            table2.spawn(async move {
                inner_ran2.set(true);
            });
        });

        table.process();
        assert!(!inner_ran.get(), "nested spawn should not run in the same cycle");
        table.process();
        assert!(inner_ran.get());
    }

    #[test]
    fn clear_drops_suspended_fibers_without_polling_them_again() {
        let table = FiberTable::new();
        let dropped = Rc::new(StdCell::new(false));
        struct MarkOnDrop(Rc<StdCell<bool>>);
        impl Drop for MarkOnDrop {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }
        let marker = MarkOnDrop(dropped.clone());
        table.spawn(async move {
            let _marker = marker;
            std::future::pending::<()>().await;
        });
        table.process();
        assert!(!dropped.get());
        table.clear();
        assert!(dropped.get());
    }
}
