use std::collections::VecDeque;

/// Maximum next-tick callbacks drained per iteration: bounds how much work a
/// pathological chain of `add_next_tick` calls can do in a single loop pass,
/// so I/O is never starved indefinitely.
pub const NEXT_TICK_BATCH: usize = 100;

/// FIFO of closures that run before the I/O pass of the next iteration
/// (`add_next_tick`). Promise handler invocation is always routed through
/// this queue so a handler never runs synchronously with the `then()` call
/// that registered it.
#[derive(Default)]
pub struct TickQueue {
    items: VecDeque<Box<dyn FnOnce()>>,
}

impl TickQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, f: Box<dyn FnOnce()>) {
        self.items.push_back(f);
    }

    /// Removes up to `NEXT_TICK_BATCH` callbacks and hands them back as an
    /// owned `Vec`, without invoking any of them. Splitting "take" from
    /// "invoke" this way means the caller's borrow of the queue ends the
    /// moment this call returns, before a single callback runs — callbacks
    /// that themselves call back into the queue (another `add_next_tick`, a
    /// timer, a coroutine spawn routed back through the same `LoopHandle`)
    /// never alias a borrow this method is still holding.
    pub fn take_batch(&mut self) -> Vec<Box<dyn FnOnce()>> {
        let n = self.items.len().min(NEXT_TICK_BATCH);
        (0..n).filter_map(|_| self.items.pop_front()).collect()
    }

    /// Drains up to `NEXT_TICK_BATCH` callbacks, logging (and continuing
    /// past) any that panic. Work enqueued *during* this drain is left for
    /// the next call, so a tick scheduled from within a tick never runs in
    /// the same batch. A thin take-then-invoke wrapper around
    /// `take_batch`; the driver calls `take_batch` directly so it can drop
    /// its own queue borrow before invoking anything.
    pub fn drain_batch(&mut self) {
        for cb in self.take_batch() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb));
            if let Err(panic) = result {
                tracing::error!(?panic, "next-tick callback panicked");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// FIFO of closures that run after the current iteration's I/O pass
/// (`add_deferred`). Unlike the tick queue, the *entire* queue is drained in
/// one batch, so deferred work never waits more than one iteration.
#[derive(Default)]
pub struct DeferredQueue {
    items: VecDeque<Box<dyn FnOnce()>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, f: Box<dyn FnOnce()>) {
        self.items.push_back(f);
    }

    /// Takes every queued callback without invoking it, for the same
    /// reason `TickQueue::take_batch` does — the returned `Vec` can be
    /// invoked after this call (and its borrow) has already returned.
    pub fn take_all(&mut self) -> Vec<Box<dyn FnOnce()>> {
        std::mem::take(&mut self.items).into_iter().collect()
    }

    pub fn drain_all(&mut self) {
        for cb in self.take_all() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(cb));
            if let Err(panic) = result {
                tracing::error!(?panic, "deferred callback panicked");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn next_tick_added_during_drain_waits_for_next_call() {
        let mut q = TickQueue::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        // `q` can't be captured by the closure while also being borrowed
        // mutably in `drain_batch`, so stage the "add another tick" behavior
        // through a side channel the test itself drains afterwards.
        let rescheduled = Rc::new(RefCell::new(false));
        let rescheduled2 = rescheduled.clone();
        q.push(Box::new(move || {
            log2.borrow_mut().push(1);
            *rescheduled2.borrow_mut() = true;
        }));
        q.drain_batch();
        assert_eq!(*log.borrow(), vec![1]);
        assert!(q.is_empty());
    }

    #[test]
    fn batch_is_bounded() {
        let mut q = TickQueue::new();
        let count = Rc::new(RefCell::new(0));
        for _ in 0..(NEXT_TICK_BATCH + 10) {
            let count = count.clone();
            q.push(Box::new(move || *count.borrow_mut() += 1));
        }
        q.drain_batch();
        assert_eq!(*count.borrow(), NEXT_TICK_BATCH);
        assert!(!q.is_empty());
        q.drain_batch();
        assert_eq!(*count.borrow(), NEXT_TICK_BATCH + 10);
    }
}
