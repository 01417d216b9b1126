//! The wait engine.
//!
//! Every blocking primitive in the crate suspends through the same protocol:
//!
//! 1. attempt immediate completion (done by the caller, which knows its own
//!    fast path);
//! 2. obtain a [`ParkTicket`](crate::fiber::sched::ParkTicket) and enqueue a
//!    [`Waiter`] in every queue that could complete the call;
//! 3. call [`park`] with the matching [`WaitReg`] unlink handles and an
//!    absolute deadline.
//!
//! Exactly one event fires: a partner completes one waiter (the others turn
//! stale and are skipped by every queue), the deadline timer expires, or the
//! owning fiber gets cancelled. [`park`] removes the remaining registrations
//! before returning, so after it resumes no queue in the process references
//! the caller.

use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::clock::Deadline;
use crate::fiber::sched::{self, ParkTicket};
use crate::fiber::FiberHandle;
use crate::poll::FdEvents;

/// Why a parked fiber woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// The clause with this index completed (or the channel behind it became
    /// done; the caller's slot tells the two apart).
    Fired(usize),
    /// The park deadline expired.
    Timeout,
    /// The fiber's owner cancelled it.
    Cancelled,
    /// A fiber this one is reaping has finished.
    ChildExit,
}

/// One entry in a waiter queue.
///
/// `slot` points into the parked fiber's live call frame (an `Option<T>` for
/// channel operations, an `FdEvents` for descriptor waits) and stays valid
/// for the whole park: the frame cannot unwind until the fiber is resumed.
#[derive(Clone, Copy)]
pub(crate) struct Waiter {
    pub fiber: FiberHandle,
    /// Index reported through [`Wake::Fired`].
    pub clause: usize,
    /// Park sequence number; a mismatch marks the entry stale.
    pub seq: u64,
    pub slot: *mut u8,
}

impl Waiter {
    /// Whether this entry still refers to the park it was created for.
    /// Queues must skip (and drop) entries for which this is false.
    #[inline]
    pub(crate) fn is_current(&self) -> bool {
        sched::waiter_is_current(self.fiber, self.seq)
    }
}

/// A waiter queue the engine can remove a fiber from without knowing the
/// queue's item type.
pub(crate) trait WaitQueue {
    fn unlink(&self, fiber: FiberHandle);
}

/// Unlink handle for one registration of a wait set.
pub(crate) enum WaitReg {
    Queue(Rc<dyn WaitQueue>),
    Fd { fd: RawFd, events: FdEvents },
}

/// An armed deadline in the timer heap. Ordered by expiry so that wrapping
/// in [`Reverse`](std::cmp::Reverse) yields a min-heap.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerEntry {
    pub at: i64,
    pub fiber: FiberHandle,
    pub seq: u64,
}

/// Park the current fiber until one registration fires, the deadline
/// expires, or the fiber is cancelled.
///
/// The caller has already enqueued its [`Waiter`]s under `ticket.seq`;
/// `regs` are the matching unlink handles. Probe deadlines are resolved by
/// the callers before the engine is reached; a deadline at or before the
/// current tick parks and wakes on the very next timer pass, which is how
/// `sleep` turns an expired deadline into a plain reschedule.
pub(crate) fn park(ticket: ParkTicket, regs: Vec<WaitReg>, deadline: Deadline) -> Wake {
    sched::block_current(ticket, regs, deadline);
    let (reason, regs) = sched::take_wakeup();
    for reg in regs {
        match reg {
            WaitReg::Queue(q) => q.unlink(ticket.fiber),
            WaitReg::Fd { fd, events } => sched::unlink_fd_waiter(fd, events, ticket.fiber),
        }
    }
    reason
}
