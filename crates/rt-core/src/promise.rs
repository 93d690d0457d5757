//! The promise state machine: a single-producer, multi-consumer handle to a
//! value that settles at most once.
//!
//! A `Promise<T, E>` is an `Rc`-backed handle: cloning it yields another
//! reference to the same underlying state. Settlement is one-shot and
//! monotonic. Every registered consumer — whether a `.then()` subscriber or
//! a fiber awaiting the promise as a `Future` — is notified through the
//! tick queue, never synchronously.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::RuntimeError;
use crate::queues::TickQueue;

pub type Scheduler = Rc<RefCell<TickQueue>>;

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

enum Handler<T, E> {
    Callback(Box<dyn FnOnce(Result<T, E>)>),
    Wake(Waker),
}

struct Inner<T, E> {
    state: State<T, E>,
    handlers: Vec<Handler<T, E>>,
}

struct CancelState {
    cancelled: bool,
    cancel_handler: Option<Box<dyn FnOnce()>>,
    reject_root: Option<Box<dyn FnOnce()>>,
}

/// Handle shared by every link in a cancellation chain. `Promise::cancel()`
/// walks to this shared state so that cancelling any chained child
/// propagates all the way back to the root promise the chain started from.
#[derive(Clone)]
pub struct CancelHandle(Rc<RefCell<CancelState>>);

impl CancelHandle {
    pub fn cancel(&self) {
        let (handler, reject) = {
            let mut state = self.0.borrow_mut();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            (state.cancel_handler.take(), state.reject_root.take())
        };
        if let Some(h) = handler {
            h();
        }
        if let Some(reject) = reject {
            reject();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.borrow().cancelled
    }
}

pub struct Promise<T: Clone + 'static, E: Clone + 'static = RuntimeError> {
    inner: Rc<RefCell<Inner<T, E>>>,
    scheduler: Scheduler,
    cancel: Option<CancelHandle>,
}

impl<T: Clone + 'static, E: Clone + 'static> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

pub struct Resolver<T: Clone + 'static, E: Clone + 'static = RuntimeError> {
    inner: Rc<RefCell<Inner<T, E>>>,
    scheduler: Scheduler,
}

impl<T: Clone + 'static, E: Clone + 'static> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Resolver<T, E> {
    pub fn resolve(&self, value: T) {
        settle(&self.inner, &self.scheduler, State::Fulfilled(value));
    }

    pub fn reject(&self, err: E) {
        settle(&self.inner, &self.scheduler, State::Rejected(err));
    }

    /// Whether this has already settled, one way or the other. Used by the
    /// driver's shutdown-rejection registry to prune entries it no longer
    /// needs to hold a reference to.
    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().state, State::Pending)
    }
}

fn settle<T: Clone + 'static, E: Clone + 'static>(
    inner: &Rc<RefCell<Inner<T, E>>>,
    scheduler: &Scheduler,
    new_state: State<T, E>,
) {
    let handlers = {
        let mut guard = inner.borrow_mut();
        if !matches!(guard.state, State::Pending) {
            // One-shot: transitions from Pending are monotonic.
            return;
        }
        guard.state = new_state;
        std::mem::take(&mut guard.handlers)
    };
    for handler in handlers {
        dispatch(inner, scheduler, handler);
    }
}

fn dispatch<T: Clone + 'static, E: Clone + 'static>(
    inner: &Rc<RefCell<Inner<T, E>>>,
    scheduler: &Scheduler,
    handler: Handler<T, E>,
) {
    match handler {
        Handler::Wake(waker) => waker.wake(),
        Handler::Callback(cb) => {
            let inner = inner.clone();
            scheduler.borrow_mut().push(Box::new(move || {
                let result = match &inner.borrow().state {
                    State::Fulfilled(v) => Ok(v.clone()),
                    State::Rejected(e) => Err(e.clone()),
                    State::Pending => unreachable!("dispatched before settlement"),
                };
                cb(result);
            }));
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Promise<T, E> {
    /// Creates a pending promise and its paired resolver (the "executor"
    /// pattern: `let (p, resolver) = Promise::pending(scheduler);`).
    pub fn pending(scheduler: &Scheduler) -> (Self, Resolver<T, E>) {
        let inner = Rc::new(RefCell::new(Inner {
            state: State::Pending,
            handlers: Vec::new(),
        }));
        let promise = Promise {
            inner: inner.clone(),
            scheduler: scheduler.clone(),
            cancel: None,
        };
        let resolver = Resolver {
            inner,
            scheduler: scheduler.clone(),
        };
        (promise, resolver)
    }

    pub fn resolved(scheduler: &Scheduler, value: T) -> Self {
        let (promise, resolver) = Self::pending(scheduler);
        resolver.resolve(value);
        promise
    }

    pub fn rejected(scheduler: &Scheduler, err: E) -> Self {
        let (promise, resolver) = Self::pending(scheduler);
        resolver.reject(err);
        promise
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The cancel handle for this link, if the promise (or an ancestor in
    /// its chain) was created cancellable.
    pub fn cancel_handle(&self) -> Option<CancelHandle> {
        self.cancel.clone()
    }

    /// Cancels the root of this promise's chain. A no-op if the chain was
    /// never made cancellable.
    pub fn cancel(&self) {
        if let Some(handle) = &self.cancel {
            handle.cancel();
        }
    }

    /// Registers a raw settlement callback, always run on a later tick.
    /// `.then()`/combinators are built on top of this.
    pub fn subscribe(&self, f: impl FnOnce(Result<T, E>) + 'static) {
        let mut guard = self.inner.borrow_mut();
        match &guard.state {
            State::Pending => guard.handlers.push(Handler::Callback(Box::new(f))),
            State::Fulfilled(v) => {
                let v = v.clone();
                drop(guard);
                self.scheduler.borrow_mut().push(Box::new(move || f(Ok(v))));
            }
            State::Rejected(e) => {
                let e = e.clone();
                drop(guard);
                self.scheduler
                    .borrow_mut()
                    .push(Box::new(move || f(Err(e))));
            }
        }
    }

    /// Chains a new promise whose settlement is derived from this one. The
    /// parent's cancel handle is inherited by the child so cancelling any
    /// link downstream still reaches the original root.
    pub fn then<T2: Clone + 'static, E2: Clone + 'static>(
        &self,
        on_fulfilled: impl FnOnce(T) -> Result<T2, E2> + 'static,
        on_rejected: impl FnOnce(E) -> Result<T2, E2> + 'static,
    ) -> Promise<T2, E2> {
        let (child, child_resolver) = Promise::pending(&self.scheduler);
        let mut child = child;
        child.cancel = self.cancel.clone();
        self.subscribe(move |result| {
            let settled = match result {
                Ok(v) => on_fulfilled(v),
                Err(e) => on_rejected(e),
            };
            match settled {
                Ok(v) => child_resolver.resolve(v),
                Err(e) => child_resolver.reject(e),
            }
        });
        child
    }

    pub fn map<T2: Clone + 'static>(
        &self,
        f: impl FnOnce(T) -> T2 + 'static,
    ) -> Promise<T2, E> {
        self.then(move |v| Ok(f(v)), Err)
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.inner.borrow().state, State::Pending)
    }
}

impl<T: Clone + 'static> Resolver<T, RuntimeError> {
    fn reject_cancellation(&self) {
        self.reject(RuntimeError::Cancellation);
    }
}

impl<T: Clone + 'static> Promise<T, RuntimeError> {
    /// Creates a cancellable pending promise. `cancel_handler` runs at most
    /// once, the first time any link in the chain is cancelled. Restricted
    /// to `E = RuntimeError` because cancellation always rejects with
    /// `RuntimeError::Cancellation`.
    pub fn cancellable(
        scheduler: &Scheduler,
        cancel_handler: impl FnOnce() + 'static,
    ) -> (Self, Resolver<T, RuntimeError>, CancelHandle) {
        let (promise, resolver) = Self::pending(scheduler);
        let reject_resolver = resolver.clone();
        let cancel_state = Rc::new(RefCell::new(CancelState {
            cancelled: false,
            cancel_handler: Some(Box::new(cancel_handler)),
            reject_root: Some(Box::new(move || reject_resolver.reject_cancellation())),
        }));
        let handle = CancelHandle(cancel_state);
        let mut promise = promise;
        promise.cancel = Some(handle.clone());
        (promise, resolver, handle)
    }
}

impl<T: Clone + 'static> Future for Promise<T, RuntimeError> {
    type Output = Result<T, RuntimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.inner.borrow_mut();
        match &guard.state {
            State::Fulfilled(v) => Poll::Ready(Ok(v.clone())),
            State::Rejected(e) => Poll::Ready(Err(e.clone())),
            State::Pending => {
                guard.handlers.push(Handler::Wake(cx.waker().clone()));
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn scheduler() -> Scheduler {
        Rc::new(RefCell::new(TickQueue::new()))
    }

    #[test]
    fn then_runs_on_a_later_tick_not_synchronously() {
        let sched = scheduler();
        let (p, resolver) = Promise::<i32, RuntimeError>::pending(&sched);
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        p.subscribe(move |_| *ran2.borrow_mut() = true);
        resolver.resolve(1);
        assert!(!*ran.borrow(), "handler must not run synchronously with settlement");
        sched.borrow_mut().drain_batch();
        assert!(*ran.borrow());
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let sched = scheduler();
        let (p, resolver) = Promise::<i32, RuntimeError>::pending(&sched);
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            p.subscribe(move |_| order.borrow_mut().push(i));
        }
        resolver.resolve(1);
        sched.borrow_mut().drain_batch();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn settlement_is_one_shot() {
        let sched = scheduler();
        let (_p, resolver) = Promise::<i32, RuntimeError>::pending(&sched);
        resolver.resolve(1);
        resolver.resolve(2); // must be ignored
        resolver.reject(RuntimeError::other("nope")); // must be ignored
    }

    #[test]
    fn cancel_invokes_handler_exactly_once_and_rejects() {
        let sched = scheduler();
        let calls = Rc::new(RefCell::new(0));
        let calls2 = calls.clone();
        let (p, _resolver, handle) =
            Promise::<i32, RuntimeError>::cancellable(&sched, move || *calls2.borrow_mut() += 1);
        let rejected = Rc::new(RefCell::new(false));
        let rejected2 = rejected.clone();
        p.subscribe(move |r| *rejected2.borrow_mut() = matches!(r, Err(e) if e.is_cancellation()));
        handle.cancel();
        handle.cancel(); // second cancel is a no-op
        sched.borrow_mut().drain_batch();
        assert_eq!(*calls.borrow(), 1);
        assert!(*rejected.borrow());
    }
}
