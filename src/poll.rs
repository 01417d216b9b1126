//! Cooperative waiting on file descriptors.
//!
//! [`wait`] parks the calling fiber until a descriptor becomes readable or
//! writable, with the usual absolute deadline. The poller keeps a small
//! cache entry per descriptor; [`clean`] drops that entry and MUST be called
//! before the application closes the descriptor, otherwise the cache may
//! end up describing an unrelated descriptor that reused the number.
//!
//! At most one fiber may wait on a given (descriptor, direction) pair at a
//! time; a second registration fails with [`Error::Busy`].
//!
//! The readiness syscall is poll(2): portable, and free of kernel-side
//! registration state, which keeps [`fork`] cheap. The scheduler invokes
//! the poller whenever the ready queue runs dry, sleeping until the nearest
//! timer deadline.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::sched;
use crate::fiber::wait::{self, WaitReg, Waiter, Wake};
use crate::fiber::FiberHandle;

bitflags::bitflags! {
    /// Readiness event bits for [`wait`]. The numeric values (`IN = 1`,
    /// `OUT = 2`) are part of the public contract.
    pub struct FdEvents: u32 {
        const IN = 1;
        const OUT = 2;
    }
}

fn native_events(events: FdEvents) -> i16 {
    let mut ev = 0;
    if events.contains(FdEvents::IN) {
        ev |= libc::POLLIN;
    }
    if events.contains(FdEvents::OUT) {
        ev |= libc::POLLOUT;
    }
    ev
}

/// Wait until one of `events` is ready on `fd`. Yields.
///
/// Returns the subset of the requested events that is actually ready.
/// Error conditions (`POLLERR`/`POLLHUP`) count as readiness for every
/// requested direction, so that the caller's subsequent I/O surfaces the
/// underlying error.
///
/// - `fd` - a file descriptor, normally in non-blocking mode
/// - `events` - combination of the [`FdEvents::IN`] | [`FdEvents::OUT`] bits
/// - `deadline` - absolute deadline; [`Deadline::PROBE`] only checks
///
/// A timed out or cancelled wait has not consumed any readiness.
pub fn wait(fd: RawFd, events: FdEvents, deadline: impl Into<Deadline>) -> Result<FdEvents> {
    let deadline = deadline.into();
    if events.is_empty() {
        return Err(Error::InvalidArg("no readiness events requested"));
    }
    if !deadline.is_probe() && sched::current_is_cancelled() {
        return Err(Error::Cancelled);
    }
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(Error::BadFd);
    }
    sched::fd_check_free(fd, events)?;

    let ready = probe(fd, events)?;
    if !ready.is_empty() {
        return Ok(ready);
    }
    if deadline.is_probe() {
        return Err(Error::TimedOut);
    }

    let mut fired = FdEvents::empty();
    let ticket = sched::begin_park();
    sched::fd_register(fd, events, ticket, (&mut fired as *mut FdEvents).cast::<u8>());
    let regs = vec![WaitReg::Fd { fd, events }];
    match wait::park(ticket, regs, deadline) {
        Wake::Fired(_) => Ok(fired),
        Wake::Timeout => Err(Error::TimedOut),
        Wake::Cancelled => Err(Error::Cancelled),
        wake => unreachable!("descriptor wait woken by {:?}", wake),
    }
}

/// Forget the poller's cache entry for `fd`.
///
/// Must be called before the descriptor is closed. No-op for an unknown
/// descriptor. Calling it while a fiber is parked on the descriptor is a
/// program error.
pub fn clean(fd: RawFd) {
    sched::with_poller(|p| p.clean(fd));
}

/// How a queue entry is validated against the fiber table. Implemented in
/// the scheduler; passed down so the poller never re-enters the runtime.
pub(crate) type IsParked<'a> = &'a dyn Fn(FiberHandle, u64) -> bool;

/// Fork the process, reinitializing the poller in the child.
///
/// Applications embedding this runtime must route fork(2) through this
/// wrapper: the child discards polling state inherited from the parent
/// before any fiber resumes.
pub fn fork() -> Result<libc::pid_t> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::IO(io::Error::last_os_error()));
    }
    if pid == 0 {
        sched::with_poller(|p| p.reinit_after_fork());
    }
    Ok(pid)
}

/// One poll(2) round with a zero timeout.
fn probe(fd: RawFd, events: FdEvents) -> Result<FdEvents> {
    let mut pfd = libc::pollfd {
        fd,
        events: native_events(events),
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(Error::IO(err));
        }
    }
    if pfd.revents & libc::POLLNVAL != 0 {
        return Err(Error::BadFd);
    }
    let hangup = pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0;
    let mut ready = FdEvents::empty();
    if events.contains(FdEvents::IN) && (pfd.revents & libc::POLLIN != 0 || hangup) {
        ready |= FdEvents::IN;
    }
    if events.contains(FdEvents::OUT) && (pfd.revents & libc::POLLOUT != 0 || hangup) {
        ready |= FdEvents::OUT;
    }
    Ok(ready)
}

////////////////////////////////////////////////////////////////////////////////
// Poller
////////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct FdEntry {
    in_waiter: Option<Waiter>,
    out_waiter: Option<Waiter>,
}

/// The descriptor cache and the poll(2) scratch space. Owned by the
/// runtime; one per scheduler.
pub(crate) struct Poller {
    fds: HashMap<RawFd, FdEntry>,
    scratch: Vec<libc::pollfd>,
}

impl Poller {
    pub(crate) fn new() -> Self {
        Poller {
            fds: HashMap::new(),
            scratch: Vec::new(),
        }
    }

    /// Whether any direction of any descriptor has a parked waiter.
    pub(crate) fn has_waiters(&self) -> bool {
        self.fds
            .values()
            .any(|e| e.in_waiter.is_some() || e.out_waiter.is_some())
    }

    /// A slot counts as taken only while its waiter's park is still live;
    /// a leftover entry of an already-woken fiber is free to overwrite.
    pub(crate) fn check_free(
        &self,
        fd: RawFd,
        events: FdEvents,
        is_parked: IsParked<'_>,
    ) -> Result<()> {
        if let Some(entry) = self.fds.get(&fd) {
            let in_taken = entry
                .in_waiter
                .map_or(false, |w| is_parked(w.fiber, w.seq));
            if events.contains(FdEvents::IN) && in_taken {
                return Err(Error::Busy);
            }
            let out_taken = entry
                .out_waiter
                .map_or(false, |w| is_parked(w.fiber, w.seq));
            if events.contains(FdEvents::OUT) && out_taken {
                return Err(Error::Busy);
            }
        }
        Ok(())
    }

    /// Claim the requested direction slots for the parking fiber. The wait
    /// is registered as one clause per direction; both write into the same
    /// out slot, so a descriptor that is readable and writable at once
    /// reports both bits.
    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        events: FdEvents,
        ticket: sched::ParkTicket,
        slot: *mut u8,
    ) {
        let entry = self.fds.entry(fd).or_default();
        if events.contains(FdEvents::IN) {
            entry.in_waiter = Some(Waiter {
                fiber: ticket.fiber,
                clause: 0,
                seq: ticket.seq,
                slot,
            });
        }
        if events.contains(FdEvents::OUT) {
            entry.out_waiter = Some(Waiter {
                fiber: ticket.fiber,
                clause: 1,
                seq: ticket.seq,
                slot,
            });
        }
    }

    pub(crate) fn clear_waiter(&mut self, fd: RawFd, events: FdEvents, fiber: FiberHandle) {
        if let Some(entry) = self.fds.get_mut(&fd) {
            if events.contains(FdEvents::IN) && entry.in_waiter.map_or(false, |w| w.fiber == fiber)
            {
                entry.in_waiter = None;
            }
            if events.contains(FdEvents::OUT)
                && entry.out_waiter.map_or(false, |w| w.fiber == fiber)
            {
                entry.out_waiter = None;
            }
        }
    }

    pub(crate) fn clean(&mut self, fd: RawFd) {
        self.fds.remove(&fd);
    }

    /// One blocking round of poll(2). Called by the scheduler with the
    /// ready queue empty, so every registered waiter is genuinely parked.
    /// Returns the (fiber, clause) pairs to wake; their out slots have
    /// already been filled.
    pub(crate) fn poll(&mut self, timeout_ms: i32) -> Vec<(FiberHandle, usize)> {
        self.scratch.clear();
        for (&fd, entry) in &self.fds {
            let mut ev = 0;
            if entry.in_waiter.is_some() {
                ev |= libc::POLLIN;
            }
            if entry.out_waiter.is_some() {
                ev |= libc::POLLOUT;
            }
            if ev != 0 {
                self.scratch.push(libc::pollfd {
                    fd,
                    events: ev,
                    revents: 0,
                });
            }
        }

        let rc = unsafe {
            libc::poll(
                self.scratch.as_mut_ptr(),
                self.scratch.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                // The scheduler recomputes timers and calls again.
                return Vec::new();
            }
            panic!("poll failed: {}", err);
        }

        let mut fired = Vec::new();
        for pfd in &self.scratch {
            if pfd.revents == 0 {
                continue;
            }
            if pfd.revents & libc::POLLNVAL != 0 {
                log::warn!(
                    "descriptor {} became invalid while a fiber waits on it \
                     (missing clean() before close?)",
                    pfd.fd
                );
            }
            let hangup =
                pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            // The ready queue was empty when this round started, so every
            // waiter found here is genuinely parked and its slot is live.
            let entry = self
                .fds
                .get_mut(&pfd.fd)
                .expect("polled descriptor vanished");
            if pfd.revents & libc::POLLIN != 0 || hangup {
                if let Some(w) = entry.in_waiter.take() {
                    unsafe { *w.slot.cast::<FdEvents>() |= FdEvents::IN };
                    fired.push((w.fiber, w.clause));
                }
            }
            if pfd.revents & libc::POLLOUT != 0 || hangup {
                if let Some(w) = entry.out_waiter.take() {
                    unsafe { *w.slot.cast::<FdEvents>() |= FdEvents::OUT };
                    fired.push((w.fiber, w.clause));
                }
            }
        }
        fired
    }

    /// Drop state that must not survive into a forked child.
    ///
    /// poll(2) keeps no kernel-side registration, so only the scratch space
    /// is discarded; descriptor entries and parked waiters re-register
    /// themselves on the next scheduling round. An epoll or kqueue backend
    /// would recreate its kernel object here.
    fn reinit_after_fork(&mut self) {
        self.scratch = Vec::new();
        log::debug!("poller reinitialized after fork");
    }
}
