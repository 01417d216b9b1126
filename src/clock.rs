//! The `clock` module returns time values derived from the Posix / C
//! `CLOCK_MONOTONIC` clock, in milliseconds.
//!
//! - [`now()`] - the cached monotonic time of the current scheduler tick
//! - [`Deadline`] - an absolute point on that clock, used by every blocking
//!   operation in the crate
//!
//! [`now()`] is cheap: the scheduler refreshes a cached reading before every
//! poll and after every context switch, so repeated calls within one tick
//! cost a single memory load. Use [`monotonic_ms()`] when an uncached
//! reading is required, e.g. when timing a computation that never yields.

use crate::fiber::sched;

/// The monotonic time of the current scheduler tick, in milliseconds.
///
/// All deadlines in this crate are expressed on this clock. The value is
/// cached per tick, which is what makes it suitable for computing timeouts
/// of yielding operations: a fiber that was descheduled for a while computes
/// its deadlines relative to the moment it resumed, not relative to a stale
/// reading taken before it slept.
#[inline(always)]
pub fn now() -> i64 {
    sched::cached_now()
}

/// An uncached monotonic reading in milliseconds. One syscall per call.
#[inline]
pub fn monotonic_ms() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        panic!("failed to read the monotonic clock: {}", err);
    }
    ts.tv_sec as i64 * 1000 + ts.tv_nsec as i64 / 1_000_000
}

////////////////////////////////////////////////////////////////////////////////
// Deadline
////////////////////////////////////////////////////////////////////////////////

/// An absolute point on the monotonic millisecond clock.
///
/// Two values are special:
/// - [`Deadline::NEVER`] (`-1`) - the operation blocks indefinitely;
/// - [`Deadline::PROBE`] (`0`) - the operation only attempts immediate
///   completion and reports [`TimedOut`](crate::Error::TimedOut) otherwise.
///
/// Everything else is an absolute timestamp compatible with [`now()`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Deadline(i64);

impl Deadline {
    /// Block indefinitely.
    pub const NEVER: Deadline = Deadline(-1);

    /// Do not block at all: attempt immediate completion only.
    pub const PROBE: Deadline = Deadline(0);

    /// A deadline at the absolute monotonic timestamp `ms`.
    #[inline(always)]
    pub const fn at(ms: i64) -> Self {
        Deadline(ms)
    }

    /// A deadline `ms` milliseconds from [`now()`].
    #[inline]
    pub fn after_ms(ms: i64) -> Self {
        Deadline(now().saturating_add(ms))
    }

    #[inline(always)]
    pub const fn is_never(&self) -> bool {
        self.0 < 0
    }

    #[inline(always)]
    pub const fn is_probe(&self) -> bool {
        self.0 == 0
    }

    /// The raw millisecond timestamp (`-1` for never, `0` for probe).
    #[inline(always)]
    pub const fn millis(&self) -> i64 {
        self.0
    }
}

impl From<i64> for Deadline {
    #[inline]
    fn from(ms: i64) -> Self {
        Deadline(ms)
    }
}
