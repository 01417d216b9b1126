//! Structured cooperative concurrency for Rust.
//!
//! This library multiplexes many lightweight **fibers** over the calling OS
//! thread and gives them the primitives they need to cooperate:
//!
//! - [Fibers: spawn, yield, sleep, structured cancellation](fiber)
//! - [Typed bounded channels with a broadcast "done" state](channel)
//! - [Select-style multiplexing over channel operations](choose)
//! - [File-descriptor readiness waits](poll) and [byte streams](stream)
//!   layered on them
//! - [A cached monotonic clock and absolute deadlines](clock)
//! - [Error handling](error) preserving the POSIX codes at the boundary
//!
//! The runtime is strictly single-threaded and cooperative: fibers switch
//! only at the documented suspension points, there is no preemption and no
//! primitive here may be touched from another OS thread. Each thread that
//! uses the crate lazily gets its own independent runtime.
//!
//! Every blocking operation takes an absolute
//! [`Deadline`](clock::Deadline) on the monotonic millisecond clock and
//! fails with [`Error::TimedOut`] once it passes - having consumed nothing.
//! Fiber lifetime is explicit: whoever [`spawn`](fiber::spawn)s a fiber
//! must eventually [`cancel`](fiber::cancel) it, which grants a grace
//! period, then aborts the target's blocking calls with
//! [`Error::Cancelled`] and reclaims its stack once it returns.
//!
//! # Example
//!
//! ```no_run
//! use spindle::channel::Channel;
//! use spindle::clock::Deadline;
//! use spindle::fiber;
//!
//! let ch = Channel::<i32>::new(0);
//! let tx = ch.clone();
//! let h = fiber::spawn(move || {
//!     tx.send(7).unwrap();
//! })
//! .unwrap();
//!
//! assert_eq!(ch.recv().unwrap(), 7);
//! fiber::cancel(&[h], Deadline::after_ms(50)).unwrap();
//! ```

pub mod channel;
pub mod choose;
pub mod clock;
pub mod error;
pub mod fiber;
pub mod poll;
pub mod stream;

pub use error::{Error, Result};
