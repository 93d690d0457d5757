//! Promise combinators: `all`, `all_settled`, `race`, `any`, `timeout`,
//! `concurrent`, and `batch`. All operate on `Promise<T, RuntimeError>` —
//! the only error type a cancellable promise can reject with (see
//! `promise::Promise::cancellable`).

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::driver::LoopHandle;
use crate::error::RuntimeError;
use crate::promise::{CancelHandle, Promise, Resolver};
use crate::timer::TimerId;

/// A unit of work for bounded-concurrency combinators. Represented as a
/// factory rather than an already-started `Promise` so `concurrent`/`batch`
/// control exactly when each task begins.
pub type Task<T> = Box<dyn FnOnce() -> Promise<T, RuntimeError>>;

/// Waits for every promise to fulfill, preserving input order. Rejects as
/// soon as any input rejects, cancelling every other still-pending input
/// that was created cancellable (the same `CancelHandle` bookkeeping
/// `concurrent` uses for its in-flight tasks).
pub fn all<T: Clone + 'static>(
    handle: &LoopHandle,
    promises: Vec<Promise<T, RuntimeError>>,
) -> Promise<Vec<T>, RuntimeError> {
    let scheduler = handle.scheduler();
    let (result, resolver) = Promise::pending(&scheduler);
    handle.track_shutdown(&resolver);
    let total = promises.len();
    if total == 0 {
        resolver.resolve(Vec::new());
        return result;
    }

    let values: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new((0..total).map(|_| None).collect()));
    let remaining = Rc::new(RefCell::new(total));
    let done = Rc::new(RefCell::new(false));
    let in_flight: Rc<RefCell<Vec<CancelHandle>>> = Rc::new(RefCell::new(Vec::new()));

    for (idx, p) in promises.into_iter().enumerate() {
        if let Some(ch) = p.cancel_handle() {
            in_flight.borrow_mut().push(ch);
        }
        let values = values.clone();
        let remaining = remaining.clone();
        let done = done.clone();
        let resolver = resolver.clone();
        let in_flight = in_flight.clone();
        p.subscribe(move |res| {
            if *done.borrow() {
                return;
            }
            match res {
                Ok(v) => {
                    values.borrow_mut()[idx] = Some(v);
                    *remaining.borrow_mut() -= 1;
                    if *remaining.borrow() == 0 {
                        *done.borrow_mut() = true;
                        let out = std::mem::take(&mut *values.borrow_mut());
                        resolver.resolve(out.into_iter().map(|v| v.expect("all settled")).collect());
                    }
                }
                Err(e) => {
                    if !*done.borrow() {
                        *done.borrow_mut() = true;
                        let handles = std::mem::take(&mut *in_flight.borrow_mut());
                        for ch in handles {
                            ch.cancel();
                        }
                        resolver.reject(e);
                    }
                }
            }
        });
    }
    result
}

/// Waits for every promise to settle, one way or the other, and never
/// rejects: each input's outcome is reported individually.
pub fn all_settled<T: Clone + 'static>(
    handle: &LoopHandle,
    promises: Vec<Promise<T, RuntimeError>>,
) -> Promise<Vec<Result<T, RuntimeError>>, RuntimeError> {
    let scheduler = handle.scheduler();
    let (result, resolver) = Promise::pending(&scheduler);
    handle.track_shutdown(&resolver);
    let total = promises.len();
    if total == 0 {
        resolver.resolve(Vec::new());
        return result;
    }

    let outcomes: Rc<RefCell<Vec<Option<Result<T, RuntimeError>>>>> =
        Rc::new(RefCell::new((0..total).map(|_| None).collect()));
    let remaining = Rc::new(RefCell::new(total));

    for (idx, p) in promises.into_iter().enumerate() {
        let outcomes = outcomes.clone();
        let remaining = remaining.clone();
        let resolver = resolver.clone();
        p.subscribe(move |res| {
            outcomes.borrow_mut()[idx] = Some(res);
            *remaining.borrow_mut() -= 1;
            if *remaining.borrow() == 0 {
                let out = std::mem::take(&mut *outcomes.borrow_mut());
                resolver.resolve(out.into_iter().map(|v| v.expect("settled")).collect());
            }
        });
    }
    result
}

/// Settles with whichever input settles first, fulfilled or rejected.
pub fn race<T: Clone + 'static>(
    handle: &LoopHandle,
    promises: Vec<Promise<T, RuntimeError>>,
) -> Promise<T, RuntimeError> {
    let scheduler = handle.scheduler();
    let (result, resolver) = Promise::pending(&scheduler);
    handle.track_shutdown(&resolver);
    let done = Rc::new(RefCell::new(false));

    for p in promises {
        let done = done.clone();
        let resolver = resolver.clone();
        p.subscribe(move |res| {
            if *done.borrow() {
                return;
            }
            *done.borrow_mut() = true;
            match res {
                Ok(v) => resolver.resolve(v),
                Err(e) => resolver.reject(e),
            }
        });
    }
    result
}

/// Resolves with the first fulfillment. Rejects with
/// `RuntimeError::Aggregate` only once every input has rejected.
pub fn any<T: Clone + 'static>(
    handle: &LoopHandle,
    promises: Vec<Promise<T, RuntimeError>>,
) -> Promise<T, RuntimeError> {
    let scheduler = handle.scheduler();
    let (result, resolver) = Promise::pending(&scheduler);
    handle.track_shutdown(&resolver);
    let total = promises.len();
    if total == 0 {
        resolver.reject(RuntimeError::Aggregate(Rc::new(Vec::new())));
        return result;
    }

    let errors: Rc<RefCell<Vec<Option<RuntimeError>>>> = Rc::new(RefCell::new((0..total).map(|_| None).collect()));
    let remaining = Rc::new(RefCell::new(total));
    let done = Rc::new(RefCell::new(false));

    for (idx, p) in promises.into_iter().enumerate() {
        let errors = errors.clone();
        let remaining = remaining.clone();
        let done = done.clone();
        let resolver = resolver.clone();
        p.subscribe(move |res| {
            if *done.borrow() {
                return;
            }
            match res {
                Ok(v) => {
                    *done.borrow_mut() = true;
                    resolver.resolve(v);
                }
                Err(e) => {
                    errors.borrow_mut()[idx] = Some(e);
                    *remaining.borrow_mut() -= 1;
                    if *remaining.borrow() == 0 {
                        *done.borrow_mut() = true;
                        let out = std::mem::take(&mut *errors.borrow_mut());
                        resolver.reject(RuntimeError::Aggregate(Rc::new(
                            out.into_iter().map(|e| e.expect("settled")).collect(),
                        )));
                    }
                }
            }
        });
    }
    result
}

/// Races `p` against a deadline. If the timer fires first, `p`'s
/// cancellation handler (if any) is invoked and the result rejects with
/// `RuntimeError::Timeout`; otherwise the pending timer is cancelled once
/// `p` settles on its own.
pub fn timeout<T: Clone + 'static>(
    handle: &LoopHandle,
    p: Promise<T, RuntimeError>,
    duration: Duration,
) -> Promise<T, RuntimeError> {
    let scheduler = handle.scheduler();
    let (result, resolver) = Promise::pending(&scheduler);
    handle.track_shutdown(&resolver);
    let done = Rc::new(RefCell::new(false));
    let timer_id: Rc<RefCell<Option<TimerId>>> = Rc::new(RefCell::new(None));

    let handle_for_settle = handle.clone();
    let done_settle = done.clone();
    let timer_id_settle = timer_id.clone();
    let resolver_settle = resolver.clone();
    p.subscribe(move |res| {
        if *done_settle.borrow() {
            return;
        }
        *done_settle.borrow_mut() = true;
        if let Some(id) = timer_id_settle.borrow_mut().take() {
            handle_for_settle.cancel_timer(id);
        }
        match res {
            Ok(v) => resolver_settle.resolve(v),
            Err(e) => resolver_settle.reject(e),
        }
    });

    let cancel_handle = p.cancel_handle();
    let id = handle.add_timer(duration, move || {
        if *done.borrow() {
            return;
        }
        *done.borrow_mut() = true;
        if let Some(c) = cancel_handle {
            c.cancel();
        }
        resolver.reject(RuntimeError::Timeout(duration));
    });
    *timer_id.borrow_mut() = Some(id);
    result
}

struct ConcurrentState<T> {
    tasks: Vec<Option<Task<T>>>,
    values: Vec<Option<T>>,
    remaining: usize,
    in_flight: Vec<CancelHandle>,
    failed: bool,
}

/// Runs `tasks` with at most `concurrency` running at once, in FIFO
/// completion order for results (the output vector mirrors input order
/// regardless of finish order). On the first rejection, every in-flight
/// task is cancelled, no further tasks are started, and the combinator
/// rejects immediately with that error.
pub fn concurrent<T: Clone + 'static>(
    handle: &LoopHandle,
    tasks: Vec<Task<T>>,
    concurrency: usize,
) -> Promise<Vec<T>, RuntimeError> {
    let scheduler = handle.scheduler();
    let (result, resolver) = Promise::pending(&scheduler);
    handle.track_shutdown(&resolver);
    let total = tasks.len();
    if total == 0 {
        resolver.resolve(Vec::new());
        return result;
    }
    let concurrency = concurrency.max(1).min(total);

    let state = Rc::new(RefCell::new(ConcurrentState {
        tasks: tasks.into_iter().map(Some).collect(),
        values: (0..total).map(|_| None).collect(),
        remaining: total,
        in_flight: Vec::new(),
        failed: false,
    }));

    for _ in 0..concurrency {
        start_next(state.clone(), resolver.clone());
    }
    result
}

fn start_next<T: Clone + 'static>(state: Rc<RefCell<ConcurrentState<T>>>, resolver: Resolver<Vec<T>, RuntimeError>) {
    let (idx, task) = {
        let mut s = state.borrow_mut();
        if s.failed {
            return;
        }
        let Some(idx) = (0..s.tasks.len()).find(|&i| s.tasks[i].is_some()) else {
            return;
        };
        let task = s.tasks[idx].take().expect("just checked Some");
        (idx, task)
    };

    let p = task();
    if let Some(ch) = p.cancel_handle() {
        state.borrow_mut().in_flight.push(ch);
    }

    let state2 = state.clone();
    let resolver2 = resolver.clone();
    p.subscribe(move |res| {
        if state2.borrow().failed {
            return;
        }
        match res {
            Ok(v) => {
                let done = {
                    let mut s = state2.borrow_mut();
                    s.values[idx] = Some(v);
                    s.remaining -= 1;
                    s.remaining == 0
                };
                if done {
                    let values = std::mem::take(&mut state2.borrow_mut().values);
                    resolver2.resolve(values.into_iter().map(|v| v.expect("settled")).collect());
                } else {
                    start_next(state2.clone(), resolver2.clone());
                }
            }
            Err(e) => {
                let in_flight = {
                    let mut s = state2.borrow_mut();
                    s.failed = true;
                    std::mem::take(&mut s.in_flight)
                };
                for ch in in_flight {
                    ch.cancel();
                }
                resolver2.reject(e);
            }
        }
    });
}

/// Splits `tasks` into chunks of `batch_size`, running each chunk via
/// `concurrent` (defaulting its concurrency to the chunk size) and
/// concatenating the results in order.
pub fn batch<T: Clone + 'static>(
    handle: &LoopHandle,
    tasks: Vec<Task<T>>,
    batch_size: usize,
    concurrency: Option<usize>,
) -> Promise<Vec<T>, RuntimeError> {
    let scheduler = handle.scheduler();
    if tasks.is_empty() {
        return Promise::resolved(&scheduler, Vec::new());
    }
    let batch_size = batch_size.max(1);
    let concurrency = concurrency.unwrap_or(batch_size);

    let mut chunks: Vec<Vec<Task<T>>> = Vec::new();
    let mut iter = tasks.into_iter();
    loop {
        let chunk: Vec<Task<T>> = iter.by_ref().take(batch_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }

    let handle = handle.clone();
    handle.spawn_async(async move {
        let mut all_values = Vec::new();
        for chunk in chunks {
            let values = concurrent(&handle, chunk, concurrency).await?;
            all_values.extend(values);
        }
        Ok(all_values)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn all_resolves_in_input_order() {
        let handle = LoopHandle::new();
        let scheduler = handle.scheduler();
        let p1 = Promise::resolved(&scheduler, 1);
        let p2 = Promise::resolved(&scheduler, 2);
        let combined = all(&handle, vec![p1, p2]);
        let result = handle.run_until_settled(&combined);
        assert_eq!(result.unwrap(), vec![1, 2]);
    }

    #[test]
    fn any_rejects_with_aggregate_when_every_input_rejects() {
        let handle = LoopHandle::new();
        let scheduler = handle.scheduler();
        let p1 = Promise::<i32, RuntimeError>::rejected(&scheduler, RuntimeError::other("a"));
        let p2 = Promise::<i32, RuntimeError>::rejected(&scheduler, RuntimeError::other("b"));
        let combined = any(&handle, vec![p1, p2]);
        let result = handle.run_until_settled(&combined);
        match result {
            Err(RuntimeError::Aggregate(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected Aggregate, got {other:?}"),
        }
    }

    #[test]
    fn timeout_rejects_when_the_inner_promise_never_settles() {
        let handle = LoopHandle::new();
        let scheduler = handle.scheduler();
        let (never, _resolver) = Promise::<i32, RuntimeError>::pending(&scheduler);
        let guarded = timeout(&handle, never, Duration::from_millis(5));
        let result = handle.run_until_settled(&guarded);
        assert!(matches!(result, Err(RuntimeError::Timeout(_))));
    }

    #[test]
    fn concurrent_stops_starting_new_tasks_after_a_failure() {
        let handle = LoopHandle::new();
        let started = Rc::new(RefCell::new(0));
        let tasks: Vec<Task<i32>> = (0..5)
            .map(|i| {
                let started = started.clone();
                let handle = handle.clone();
                Box::new(move || {
                    *started.borrow_mut() += 1;
                    let scheduler = handle.scheduler();
                    if i == 0 {
                        Promise::rejected(&scheduler, RuntimeError::other("boom"))
                    } else {
                        Promise::resolved(&scheduler, i)
                    }
                }) as Task<i32>
            })
            .collect();
        let combined = concurrent(&handle, tasks, 1);
        let result = handle.run_until_settled(&combined);
        assert!(result.is_err());
        assert_eq!(*started.borrow(), 1);
    }
}
