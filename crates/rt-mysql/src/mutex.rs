//! Single-threaded async mutex serializing command round-trips on one
//! connection. MySQL's wire protocol is strictly request/response — a
//! second command cannot be written while a result set is still being
//! read — so every `MySqlConnection` method acquires this before touching
//! the socket.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::task::Waker;

struct Inner {
    locked: bool,
    waiters: VecDeque<Waker>,
}

/// Cloneable handle; clones share the same lock state, mirroring how
/// `rt_core::promise::Promise` shares its `Rc<RefCell<Inner>>`.
#[derive(Clone)]
pub struct AsyncMutex {
    inner: Rc<RefCell<Inner>>,
}

impl AsyncMutex {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                locked: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    pub async fn lock(&self) -> MutexGuard {
        std::future::poll_fn(|cx| {
            let mut inner = self.inner.borrow_mut();
            if inner.locked {
                inner.waiters.push_back(cx.waker().clone());
                std::task::Poll::Pending
            } else {
                inner.locked = true;
                std::task::Poll::Ready(())
            }
        })
        .await;
        MutexGuard {
            inner: self.inner.clone(),
        }
    }
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MutexGuard {
    inner: Rc<RefCell<Inner>>,
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.locked = false;
        if let Some(waker) = inner.waiters.pop_front() {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rt_core::LoopHandle;

    #[test]
    fn second_lock_waits_for_first_guard_to_drop() {
        let handle = LoopHandle::new();
        let mutex = AsyncMutex::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let m1 = mutex.clone();
        let o1 = order.clone();
        handle.spawn(async move {
            let _guard = m1.lock().await;
            o1.borrow_mut().push(1);
        });

        let m2 = mutex.clone();
        let o2 = order.clone();
        let done = handle.spawn_async(async move {
            let _guard = m2.lock().await;
            o2.borrow_mut().push(2);
            Ok(())
        });

        handle.run_until_settled(&done).unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
