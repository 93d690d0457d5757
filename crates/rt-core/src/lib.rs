//! The cooperative, single-threaded event loop: promises, coroutines,
//! timers, and the socket/HTTP polling seams that higher-level crates
//! (`rt-http`, `rt-mysql`, `rt-pool`) plug into.
//!
//! There is no global loop instance. Every entry point takes an explicit
//! `&LoopHandle`, and every shared mutable type in this crate is `Rc`/
//! `RefCell` rather than `Arc`/`Mutex` — a `LoopHandle` simply does not
//! implement `Send`, so the compiler rejects any attempt to use it from more
//! than one thread.

pub mod clock;
pub mod combinators;
pub mod driver;
pub mod error;
pub mod fiber;
pub mod io;
pub mod promise;
pub mod pump;
pub mod queues;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use combinators::{all, all_settled, any, batch, concurrent, race, timeout, Task};
pub use driver::LoopHandle;
pub use error::{OtherError, RuntimeError};
pub use fiber::FiberId;
pub use io::IoRegistry;
pub use promise::{CancelHandle, Promise, Resolver, Scheduler};
pub use pump::{HttpPump, NullPump};
pub use queues::{DeferredQueue, TickQueue, NEXT_TICK_BATCH};
pub use timer::TimerId;
