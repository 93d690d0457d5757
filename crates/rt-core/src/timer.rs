use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

pub type TimerId = u64;

/// A single scheduled callback. `seq` is the insertion order, used to break
/// ties between timers with an identical `deadline` so they fire in the
/// order they were scheduled.
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: TimerId,
    callback: Option<Box<dyn FnOnce()>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline (and, for
        // ties, the lowest seq) to pop first, so reverse the comparison.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of `(deadline, id, callback)` ordered by deadline with FIFO
/// tie-breaking. `advance(now)` pops and invokes every entry whose deadline
/// has passed; `next_delay(now)` reports how long until the next entry is
/// due, for the driver's adaptive-sleep calculation.
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<TimerEntry>,
    cancelled_ids: HashSet<TimerId>,
    next_id: TimerId,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, deadline: Instant, callback: Box<dyn FnOnce()>) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            id,
            callback: Some(callback),
        });
        id
    }

    /// Marks a timer cancelled. The entry is dropped (without running its
    /// callback) the next time it would otherwise pop, rather than being
    /// removed from the heap immediately — `BinaryHeap` has no efficient
    /// arbitrary removal, so we tombstone instead.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled_ids.insert(id);
    }

    /// Pops every entry due at or before `now` and hands the callbacks back
    /// as an owned `Vec`, without running any of them. A timer added by a
    /// callback that runs *after* this call returns (even with delay zero)
    /// is necessarily missed this pass and picked up on the next `advance`/
    /// `take_due` — the same "no work enqueued during a drain runs in that
    /// same drain" rule the tick queue follows. Splitting take from
    /// invocation means a fired callback that itself calls `add_timer`
    /// (e.g. a retry backoff rescheduling itself) never reaches back into a
    /// wheel this method is still borrowing.
    pub fn take_due(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let mut due = Vec::new();
        loop {
            match self.heap.peek() {
                Some(entry) if entry.deadline <= now => {
                    let mut entry = self.heap.pop().expect("peeked Some");
                    if self.cancelled_ids.remove(&entry.id) {
                        continue;
                    }
                    if let Some(cb) = entry.callback.take() {
                        due.push(cb);
                    }
                }
                _ => break,
            }
        }
        due
    }

    /// Runs every entry due at or before `now`. A thin take-then-invoke
    /// wrapper around `take_due`; the driver calls `take_due` directly so
    /// it can drop its own wheel borrow before invoking anything.
    pub fn advance(&mut self, now: Instant) {
        for cb in self.take_due(now) {
            cb();
        }
    }

    /// Delay until the earliest live timer is due, or `None` if the wheel is
    /// empty (ignoring already-cancelled entries at the front).
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        while let Some(entry) = self.heap.peek() {
            if self.cancelled_ids.contains(&entry.id) {
                self.heap.pop();
                continue;
            }
            break;
        }
        self.heap
            .peek()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops all pending timers without running their callbacks (used by
    /// `force_stop`).
    pub fn clear(&mut self) {
        self.heap.clear();
        self.cancelled_ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn fires_in_deadline_then_insertion_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));

        let push = |wheel: &mut TimerWheel, order: Rc<RefCell<Vec<&'static str>>>, label, at| {
            let order = order.clone();
            wheel.add(at, Box::new(move || order.borrow_mut().push(label)));
        };
        // Two timers at the identical deadline must run in insertion order.
        push(&mut wheel, order.clone(), "a", now);
        push(&mut wheel, order.clone(), "b", now);
        push(&mut wheel, order.clone(), "c", now + Duration::from_secs(1));

        wheel.advance(now);
        assert_eq!(*order.borrow(), vec!["a", "b"]);
        wheel.advance(now + Duration::from_secs(1));
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let id = wheel.add(now, Box::new(move || *fired2.borrow_mut() = true));
        wheel.cancel(id);
        wheel.advance(now);
        assert!(!*fired.borrow());
    }

    #[test]
    fn next_delay_reports_earliest_live_timer() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        let id = wheel.add(now + Duration::from_millis(10), Box::new(|| {}));
        wheel.add(now + Duration::from_millis(50), Box::new(|| {}));
        assert_eq!(wheel.next_delay(now), Some(Duration::from_millis(10)));
        wheel.cancel(id);
        assert_eq!(wheel.next_delay(now), Some(Duration::from_millis(50)));
    }
}
