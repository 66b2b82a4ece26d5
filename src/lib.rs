//! `Gate` provide a sync primitive that holds a boolean which threads and coroutines can wait on.
//!
//! Any number of waiters can block until the gate becomes true or false, with an optional
//! timeout or `CancelToken`. Every transition is broadcast to locked observers, which run while
//! the gate lock is still held, and to unlocked observers, which run after it is released.
//!
//! The `*_then_reset` waits provide a single consumer hand off: each transition to the awaited
//! value releases exactly one queued waiter and flips the gate straight back.
//!
//! `Worker` is a cancellable background loop expressed with three gates: `running`, `working`
//! and `work_available`. You can call `Worker::start` and `Worker::stop` from any thread,
//! `stop` only returns once the loop has exited.

#[macro_use]
extern crate log;

mod cancel;
pub use cancel::{CancelRegistration, CancelToken};

mod dispose;
pub use dispose::Disposal;

mod error;
pub use error::{BoxError, Error, Result, WorkError};

mod observer;

mod gate;
pub use gate::Gate;

mod worker;
pub use worker::{Work, Worker, WorkerConfig, WorkerStats};
