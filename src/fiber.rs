//! Cooperative multitasking module.
//!
//! With the fiber module, you can:
//! - create and run [fibers](spawn) - lightweight flows of control with
//!   their own stacks, multiplexed over the calling OS thread;
//! - [`yield_now`] the processor, [`sleep`] until a deadline, and
//!   [`cancel`] fibers you spawned.
//!
//! A fiber has four possible states: **ready**, **running**, **blocked** or
//! **finished**. [`spawn`] enqueues the new fiber at the tail of the ready
//! queue and does not yield; the fiber first runs when the scheduler reaches
//! it. A fiber blocks only at the documented suspension points (channel
//! operations, [`choose`](crate::choose::choose), [`sleep`],
//! [`poll::wait`](crate::poll::wait), [`yield_now`], [`cancel`]); everything
//! else runs to completion without a context switch.
//!
//! Cancellation is cooperative and sticky: [`cancel`] grants its targets a
//! grace period, then sets their cancel flag, after which every subsequent
//! suspension point of a target fails with
//! [`Error::Cancelled`](crate::Error::Cancelled). A cancelled fiber is
//! expected to clean up (non-suspending operations still work) and return
//! from its entry function. A fiber's stack is reclaimed only by [`cancel`],
//! even if the fiber already finished; a handle that is never cancelled
//! leaks its stack.

use std::os::raw::c_void;

use crate::clock::Deadline;
use crate::error::{Error, Result};

pub(crate) mod context;
pub(crate) mod sched;
pub(crate) mod stack;
pub(crate) mod wait;

pub use self::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

use self::wait::Wake;

/// Identifies a spawned fiber.
///
/// Handles are small indices into a runtime-owned arena, not pointers: after
/// [`cancel`] reaps the fiber the handle goes stale and every later use of
/// it fails with [`Error::InvalidArg`] instead of touching freed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberHandle {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// The currently supported configurations are:
///
/// * `name`:       an associated name, visible in trace logs
/// * `stack_size`: the stack size for the fiber
///
/// The [`spawn`](Builder::spawn) method takes ownership of the builder and
/// creates the fiber. The [`fiber::spawn`](spawn) free function uses a
/// builder with the default configuration.
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber. Rounded up
    /// to the page size; sizes below [`MIN_STACK_SIZE`] are rejected.
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::InvalidArg("stack size below the supported minimum"));
        }
        self.stack_size = stack_size;
        Ok(self)
    }

    /// Spawns the fiber. It is enqueued at the tail of the ready queue; the
    /// caller keeps running.
    ///
    /// The returned handle must eventually be passed to [`cancel`], which is
    /// the only way to reclaim the fiber's stack.
    pub fn spawn<F>(self, f: F) -> Result<FiberHandle>
    where
        F: FnOnce() + 'static,
    {
        sched::spawn_fiber(self.name, self.stack_size, Box::new(f))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Spawn a fiber with the default configuration.
///
/// Equivalent to `Builder::new().spawn(f)`. See [`Builder`].
#[inline]
pub fn spawn<F>(f: F) -> Result<FiberHandle>
where
    F: FnOnce() + 'static,
{
    Builder::new().spawn(f)
}

/// Yield control to the scheduler.
///
/// The calling fiber is requeued at the tail of the ready queue; control
/// returns once every fiber ahead of it has run. Returns
/// [`Error::Cancelled`] without yielding if the fiber was cancelled.
pub fn yield_now() -> Result<()> {
    if sched::current_is_cancelled() {
        return Err(Error::Cancelled);
    }
    sched::yield_current();
    Ok(())
}

/// Put the calling fiber to sleep until the absolute `deadline`.
///
/// Reaching the deadline is the successful outcome. A deadline in the past
/// still passes through the scheduler, so `sleep(Deadline::PROBE)` is a
/// fancy [`yield_now`].
///
/// > **Note:** this is a cancellation point.
pub fn sleep(deadline: impl Into<Deadline>) -> Result<()> {
    let deadline = deadline.into();
    if sched::current_is_cancelled() {
        return Err(Error::Cancelled);
    }
    let ticket = sched::begin_park();
    match wait::park(ticket, Vec::new(), deadline) {
        Wake::Timeout => Ok(()),
        Wake::Cancelled => Err(Error::Cancelled),
        wake => unreachable!("sleep woken by {:?}", wake),
    }
}

/// Check whether the calling fiber was cancelled by its owner.
///
/// The flag is sticky: once set it never clears, and every subsequent
/// suspension point fails with [`Error::Cancelled`]. Non-suspending
/// operations are unaffected, which is what lets cleanup code run.
#[inline]
pub fn is_cancelled() -> bool {
    sched::current_is_cancelled()
}

/// Cancel `targets` and reclaim their stacks.
///
/// The call proceeds in three steps:
///
/// 1. until `deadline`, wait for the targets to finish by themselves;
/// 2. once the deadline fires, set the cancel flag of every survivor and
///    abort its in-flight blocking call with
///    [`Error::Cancelled`](crate::Error::Cancelled);
/// 3. wait (without further deadline) until every target has returned from
///    its entry function, then free the fibers and their stacks.
///
/// `Deadline::PROBE` skips straight to step 2; `Deadline::NEVER` never
/// leaves step 1. After the call returns `Ok`, no target has executed any
/// further code and every handle in `targets` is stale.
///
/// If the caller is itself cancelled while waiting, the remaining grace
/// period is skipped, the targets are still reaped to completion, and the
/// call reports [`Error::Cancelled`](crate::Error::Cancelled) afterwards.
pub fn cancel(targets: &[FiberHandle], deadline: impl Into<Deadline>) -> Result<()> {
    let deadline = deadline.into();
    let me = sched::current_handle();
    for (i, h) in targets.iter().enumerate() {
        if *h == me {
            return Err(Error::InvalidArg("a fiber cannot cancel itself"));
        }
        if !sched::fiber_is_live(*h) {
            return Err(Error::InvalidArg("stale or unknown fiber handle"));
        }
        if targets[..i].contains(h) {
            return Err(Error::InvalidArg("duplicate fiber handle"));
        }
    }

    let all_finished = |hs: &[FiberHandle]| hs.iter().all(|h| sched::fiber_is_finished(*h));
    let mut caller_cancelled = sched::current_is_cancelled();

    // Grace: let the targets finish on their own.
    if !deadline.is_probe() && !caller_cancelled {
        while !all_finished(targets) {
            let ticket = sched::begin_park();
            for h in targets {
                sched::set_exit_waiter(*h, ticket);
            }
            match wait::park(ticket, Vec::new(), deadline) {
                Wake::ChildExit => continue,
                Wake::Timeout => break,
                Wake::Cancelled => {
                    caller_cancelled = true;
                    break;
                }
                wake => unreachable!("cancel woken by {:?}", wake),
            }
        }
    }

    // Force: survivors get the sticky flag and their blocking calls abort.
    for h in targets {
        if !sched::fiber_is_finished(*h) {
            log::debug!("cancelling fiber {:?}", h);
            sched::flag_cancel(*h);
        }
    }

    // Reap: wait for every target to return from its entry function.
    while !all_finished(targets) {
        let ticket = sched::begin_park();
        for h in targets {
            sched::set_exit_waiter(*h, ticket);
        }
        match wait::park(ticket, Vec::new(), Deadline::NEVER) {
            Wake::ChildExit => {}
            Wake::Cancelled => caller_cancelled = true,
            wake => unreachable!("cancel woken by {:?}", wake),
        }
    }
    for h in targets {
        sched::reap_fiber(*h);
    }

    if caller_cancelled {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber-local storage
////////////////////////////////////////////////////////////////////////////////

/// Store an opaque pointer in the calling fiber's local slot.
///
/// Each fiber owns exactly one such slot, typically pointing at some
/// per-fiber owner structure. The runtime never dereferences it.
#[inline]
pub fn set_local(p: *mut c_void) {
    sched::set_local_ptr(p)
}

/// The pointer stored by [`set_local`], or null if none was set.
#[inline]
pub fn local() -> *mut c_void {
    sched::local_ptr()
}

////////////////////////////////////////////////////////////////////////////////
// Context switch tracking
////////////////////////////////////////////////////////////////////////////////

/// Returns the number of times the calling fiber passed through the
/// scheduler. Mostly useful for testing.
#[inline]
pub fn csw() -> u64 {
    sched::current_csw()
}

/// Calls a function and checks whether it yielded.
///
/// It's mostly useful in tests.
///
/// # Example
///
/// ```no_run
/// use spindle::clock::Deadline;
/// use spindle::fiber::{self, check_yield, YieldResult};
///
/// assert_eq!(
///     check_yield(|| fiber::sleep(Deadline::PROBE).unwrap()),
///     YieldResult::Yielded(())
/// );
/// ```
pub fn check_yield<F, T>(f: F) -> YieldResult<T>
where
    F: FnOnce() -> T,
{
    let csw_before = csw();
    let res = f();
    if csw() == csw_before {
        YieldResult::DidntYield(res)
    } else {
        YieldResult::Yielded(res)
    }
}

/// Possible [`check_yield`] results.
#[derive(Debug, PartialEq, Eq)]
pub enum YieldResult<T> {
    /// The function did yield.
    Yielded(T),
    /// The function didn't yield.
    DidntYield(T),
}
