//! Socket/stream watchers.
//!
//! Wraps a single `mio::Poll` instance — the one reactor for the whole
//! process, since the loop is single-threaded. Callers (the HTTP pump, the
//! MySQL connection) register their own `mio` source against
//! `IoRegistry::registry()` under a `Token` obtained from `new_token()`, then
//! attach a readiness callback with `set_read_watcher`/`set_write_watcher`.
//! `poll_once` is the zero-timeout, non-blocking pass the driver issues once
//! per iteration; `poll_for` additionally allows the driver's adaptive sleep
//! to block inside the same syscall instead of spin-polling.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::{Events, Poll, Token};

#[derive(Default)]
struct Watchers {
    read: Option<Box<dyn FnMut()>>,
    write: Option<Box<dyn FnMut()>>,
}

pub struct IoRegistry {
    poll: Poll,
    events: Events,
    next_token: usize,
    watchers: HashMap<Token, Watchers>,
}

impl IoRegistry {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            next_token: 0,
            watchers: HashMap::new(),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    pub fn new_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn set_read_watcher(&mut self, token: Token, f: Box<dyn FnMut()>) {
        self.watchers.entry(token).or_default().read = Some(f);
    }

    pub fn set_write_watcher(&mut self, token: Token, f: Box<dyn FnMut()>) {
        self.watchers.entry(token).or_default().write = Some(f);
    }

    pub fn remove_read_watcher(&mut self, token: Token) {
        if let Some(entry) = self.watchers.get_mut(&token) {
            entry.read = None;
        }
        self.gc(token);
    }

    pub fn remove_write_watcher(&mut self, token: Token) {
        if let Some(entry) = self.watchers.get_mut(&token) {
            entry.write = None;
        }
        self.gc(token);
    }

    /// Drops the bookkeeping entry once neither watcher is set. Callers are
    /// responsible for deregistering the underlying `mio` source itself.
    fn gc(&mut self, token: Token) {
        if matches!(self.watchers.get(&token), Some(w) if w.read.is_none() && w.write.is_none()) {
            self.watchers.remove(&token);
        }
    }

    /// One non-blocking pass: poll with a zero timeout and invoke every
    /// ready callback. Returns the number of events observed.
    pub fn poll_once(&mut self) -> io::Result<usize> {
        self.poll_for(Some(Duration::ZERO))
    }

    /// Polls, optionally blocking up to `timeout` (used by the driver's
    /// adaptive sleep when there is otherwise no work to do), and invokes
    /// every ready watcher directly. Kept as a self-contained convenience
    /// for callers (and tests) that only need the registry in isolation;
    /// the driver itself goes through `take_ready`/`take_*_watcher`/
    /// `restore_*_watcher` instead, so it can drop its own borrow of this
    /// registry before any watcher runs — see `driver::LoopHandle::
    /// poll_io` for why that split matters.
    pub fn poll_for(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let ready = self.take_ready(timeout)?;
        let n = ready.len();
        for (token, readable, writable) in ready {
            if readable {
                if let Some(mut f) = self.take_read_watcher(token) {
                    f();
                    self.restore_read_watcher(token, f);
                }
            }
            if writable {
                if let Some(mut f) = self.take_write_watcher(token) {
                    f();
                    self.restore_write_watcher(token, f);
                }
            }
        }
        Ok(n)
    }

    /// Polls mio for readiness and reports it as `(token, readable,
    /// writable)` tuples, without touching any watcher closure. The
    /// mutable borrow this takes ends when it returns, before any
    /// application callback has a chance to run.
    pub fn take_ready(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(Token, bool, bool)>> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect())
    }

    /// Removes and returns a token's read watcher, if any, leaving its
    /// write watcher (if set) untouched.
    pub fn take_read_watcher(&mut self, token: Token) -> Option<Box<dyn FnMut()>> {
        self.watchers.get_mut(&token).and_then(|w| w.read.take())
    }

    pub fn take_write_watcher(&mut self, token: Token) -> Option<Box<dyn FnMut()>> {
        self.watchers.get_mut(&token).and_then(|w| w.write.take())
    }

    /// Puts a read watcher back after invoking it, but only if the slot is
    /// still empty — a watcher that replaced or removed itself (or its
    /// socket) during its own invocation wins over blindly restoring the
    /// stale closure.
    pub fn restore_read_watcher(&mut self, token: Token, f: Box<dyn FnMut()>) {
        let entry = self.watchers.entry(token).or_default();
        if entry.read.is_none() {
            entry.read = Some(f);
        }
    }

    pub fn restore_write_watcher(&mut self, token: Token, f: Box<dyn FnMut()>) {
        let entry = self.watchers.entry(token).or_default();
        if entry.write.is_none() {
            entry.write = Some(f);
        }
    }

    /// Drops every tracked watcher. Used by `force_stop`: combined with
    /// abandoning every suspended fiber (which drops whatever `Socket` it
    /// owned, deregistering and closing the underlying stream via that
    /// `Drop` impl), this is how a forced shutdown actually closes sockets
    /// rather than merely stop scheduling work on them.
    pub fn close_all(&mut self) {
        self.watchers.clear();
    }
}
