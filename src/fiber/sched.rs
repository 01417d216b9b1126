//! The scheduler.
//!
//! One OS thread owns one [`Runtime`]: a fiber arena, a strict-FIFO ready
//! queue, the timer heap and the descriptor poller. Fibers are cooperatively
//! multiplexed - a context switch happens only inside [`schedule`], and
//! [`schedule`] is reached only from the documented suspension points.
//!
//! There is no dedicated scheduler stack. A fiber that blocks picks the next
//! ready fiber and switches straight to it; when nothing is ready it drives
//! the poller from its own stack until a wakeup arrives.
//!
//! The runtime is created lazily on the first use and lives until the thread
//! exits. It is accessed through a raw thread-local pointer: borrows of the
//! runtime must never be held across a context switch, so every helper here
//! re-acquires the reference and keeps it scoped.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;

use crate::clock;
use crate::clock::Deadline;
use crate::error::Error;
use crate::fiber::context::{self, Context};
use crate::fiber::stack::{Stack, StackPool};
use crate::fiber::wait::{TimerEntry, Wake, WaitReg};
use crate::fiber::FiberHandle;
use crate::poll::{FdEvents, Poller};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Ready,
    Running,
    Blocked,
    Finished,
}

/// Per-fiber control block. Boxed so its address survives arena growth:
/// the context switch and the launch trampoline keep raw pointers into it.
struct FiberCb {
    handle: FiberHandle,
    name: String,
    state: State,
    ctx: Context,
    /// `None` for the main fiber, which runs on the thread's own stack.
    stack: Option<Stack>,
    /// Taken by the trampoline on first run.
    entry: Option<Box<dyn FnOnce()>>,
    /// Sticky; set by `fiber::cancel` on the owner's behalf.
    cancelled: bool,
    wake_reason: Option<Wake>,
    /// Bumped at every park; stale queue entries carry an older value.
    park_seq: u64,
    /// Unlink handles of the active wait set.
    regs: Vec<WaitReg>,
    /// The park of the fiber reaping this one, to be woken when we finish.
    exit_waiter: Option<(FiberHandle, u64)>,
    /// Fiber-local storage slot.
    local: *mut c_void,
    /// Number of times this fiber passed through the scheduler.
    csw: u64,
}

struct FiberSlot {
    gen: u32,
    cb: Option<Box<FiberCb>>,
}

struct Runtime {
    fibers: Vec<FiberSlot>,
    free_slots: Vec<u32>,
    ready: VecDeque<FiberHandle>,
    current: FiberHandle,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    poller: Poller,
    stacks: StackPool,
    now_cache: i64,
}

thread_local! {
    static RUNTIME: Cell<*mut Runtime> = const { Cell::new(std::ptr::null_mut()) };
}

/// The runtime of the calling thread, created on first use.
///
/// The returned reference must not outlive the current scheduling step; in
/// particular it must not be held across [`context::switch`].
fn runtime() -> &'static mut Runtime {
    RUNTIME.with(|cell| {
        let mut ptr = cell.get();
        if ptr.is_null() {
            ptr = Box::into_raw(Box::new(Runtime::new()));
            cell.set(ptr);
        }
        unsafe { &mut *ptr }
    })
}

impl Runtime {
    fn new() -> Self {
        let main = FiberHandle { index: 0, gen: 1 };
        let cb = Box::new(FiberCb {
            handle: main,
            name: "main".into(),
            state: State::Running,
            ctx: Context::empty(),
            stack: None,
            entry: None,
            cancelled: false,
            wake_reason: None,
            park_seq: 0,
            regs: Vec::new(),
            exit_waiter: None,
            local: std::ptr::null_mut(),
            csw: 0,
        });
        Runtime {
            fibers: vec![FiberSlot {
                gen: 1,
                cb: Some(cb),
            }],
            free_slots: Vec::new(),
            ready: VecDeque::new(),
            current: main,
            timers: BinaryHeap::new(),
            poller: Poller::new(),
            stacks: StackPool::new(),
            now_cache: clock::monotonic_ms(),
        }
    }

    fn cb_opt(&self, h: FiberHandle) -> Option<&FiberCb> {
        let slot = self.fibers.get(h.index as usize)?;
        if slot.gen != h.gen {
            return None;
        }
        slot.cb.as_deref()
    }

    fn cb_opt_mut(&mut self, h: FiberHandle) -> Option<&mut FiberCb> {
        let slot = self.fibers.get_mut(h.index as usize)?;
        if slot.gen != h.gen {
            return None;
        }
        slot.cb.as_deref_mut()
    }

    fn cb_mut(&mut self, h: FiberHandle) -> &mut FiberCb {
        self.cb_opt_mut(h).expect("stale fiber handle")
    }

    fn alloc_slot(&mut self) -> FiberHandle {
        if let Some(index) = self.free_slots.pop() {
            FiberHandle {
                index,
                gen: self.fibers[index as usize].gen,
            }
        } else {
            self.fibers.push(FiberSlot { gen: 1, cb: None });
            FiberHandle {
                index: (self.fibers.len() - 1) as u32,
                gen: 1,
            }
        }
    }

    fn wake(&mut self, h: FiberHandle, reason: Wake) {
        match self.cb_opt_mut(h) {
            Some(cb) if cb.state == State::Blocked => {
                cb.state = State::Ready;
                cb.wake_reason = Some(reason);
            }
            _ => return,
        }
        self.ready.push_back(h);
    }

    /// Earliest armed deadline, dropping stale heap entries on the way.
    fn next_timer_deadline(&mut self) -> Option<i64> {
        loop {
            let entry = match self.timers.peek() {
                Some(&Reverse(entry)) => entry,
                None => return None,
            };
            let current = self
                .cb_opt(entry.fiber)
                .map_or(false, |cb| cb.state == State::Blocked && cb.park_seq == entry.seq);
            if current {
                return Some(entry.at);
            }
            self.timers.pop();
        }
    }

    fn fire_due_timers(&mut self) {
        while let Some(at) = self.next_timer_deadline() {
            if at > self.now_cache {
                break;
            }
            let Reverse(entry) = self.timers.pop().expect("peeked entry vanished");
            self.wake(entry.fiber, Wake::Timeout);
        }
    }

    /// One pass of the event loop: fire due timers, then sleep in the
    /// polling syscall until the nearest deadline or a descriptor event.
    ///
    /// Called only when the ready queue is empty, which guarantees that
    /// every registered waiter is genuinely parked.
    fn poll_once(&mut self) {
        self.now_cache = clock::monotonic_ms();
        self.fire_due_timers();
        if !self.ready.is_empty() {
            return;
        }

        let timeout = match self.next_timer_deadline() {
            Some(at) => (at - self.now_cache).max(0).min(i32::MAX as i64) as i32,
            None => -1,
        };
        if timeout < 0 && !self.poller.has_waiters() {
            panic!(
                "deadlock: every fiber is blocked and neither a timer \
                 nor a descriptor wait can wake one"
            );
        }

        let fired = self.poller.poll(timeout);
        self.now_cache = clock::monotonic_ms();
        for (fiber, clause) in fired {
            self.wake(fiber, Wake::Fired(clause));
        }
        self.fire_due_timers();
    }

    fn pick_next(&mut self) -> FiberHandle {
        loop {
            if let Some(h) = self.ready.pop_front() {
                return h;
            }
            self.poll_once();
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Scheduling
////////////////////////////////////////////////////////////////////////////////

/// Hand the thread over to the next ready fiber.
///
/// The caller has already put the current fiber into its target state
/// (requeued, blocked or finished). Returns when the current fiber is
/// resumed; for a finished fiber it never returns.
fn schedule() {
    let mut cur_ctx: *mut Context = std::ptr::null_mut();
    let mut next_ctx: *const Context = std::ptr::null();
    let mut switching = false;
    {
        let rt = runtime();
        let cur = rt.current;
        rt.cb_mut(cur).csw += 1;
        let next = rt.pick_next();
        if next == cur {
            // The only runnable fiber is the one already on the CPU.
            rt.cb_mut(cur).state = State::Running;
        } else {
            let cb = rt.cb_mut(next);
            cb.state = State::Running;
            rt.current = next;
            next_ctx = &rt.cb_mut(next).ctx as *const Context;
            cur_ctx = &mut rt.cb_mut(cur).ctx as *mut Context;
            switching = true;
        }
    }
    if switching {
        unsafe { context::switch(cur_ctx, next_ctx) };
        // Resumed; the fiber that switched here already updated `current`.
        runtime().now_cache = clock::monotonic_ms();
    }
}

extern "C" fn fiber_main(arg: *mut u8) -> ! {
    runtime().now_cache = clock::monotonic_ms();
    let f = unsafe {
        (*arg.cast::<FiberCb>())
            .entry
            .take()
            .expect("fiber launched twice")
    };
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        log::error!("fiber '{}' panicked: {}", current_name(), msg);
    }
    finish_current()
}

pub(crate) fn spawn_fiber(
    name: Option<String>,
    stack_size: usize,
    f: Box<dyn FnOnce()>,
) -> Result<FiberHandle, Error> {
    let rt = runtime();
    let stack = rt.stacks.acquire(stack_size)?;
    let handle = rt.alloc_slot();
    let mut cb = Box::new(FiberCb {
        handle,
        name: name.unwrap_or_else(|| format!("fiber-{}", handle.index)),
        state: State::Ready,
        ctx: Context::empty(),
        stack: Some(stack),
        entry: Some(f),
        cancelled: false,
        wake_reason: None,
        park_seq: 0,
        regs: Vec::new(),
        exit_waiter: None,
        local: std::ptr::null_mut(),
        csw: 0,
    });
    let top = cb.stack.as_ref().expect("fresh fiber has a stack").top();
    let arg = (&mut *cb as *mut FiberCb).cast::<u8>();
    cb.ctx = unsafe { context::prepare(top, fiber_main, arg) };
    log::trace!("spawn fiber '{}'", cb.name);
    rt.fibers[handle.index as usize].cb = Some(cb);
    // New fibers go to the tail; the caller keeps running.
    rt.ready.push_back(handle);
    Ok(handle)
}

/// Requeue the current fiber at the tail and run whoever is next.
pub(crate) fn yield_current() {
    {
        let rt = runtime();
        let cur = rt.current;
        rt.cb_mut(cur).state = State::Ready;
        rt.ready.push_back(cur);
    }
    schedule();
}

/// Mark the current fiber finished and leave its stack for the reaper.
pub(crate) fn finish_current() -> ! {
    {
        let rt = runtime();
        let cur = rt.current;
        let cb = rt.cb_mut(cur);
        cb.state = State::Finished;
        log::trace!("fiber '{}' finished", cb.name);
        let waiter = cb.exit_waiter;
        if let Some((w, seq)) = waiter {
            let parked = rt
                .cb_opt(w)
                .map_or(false, |cb| cb.state == State::Blocked && cb.park_seq == seq);
            if parked {
                rt.wake(w, Wake::ChildExit);
            }
        }
    }
    schedule();
    unreachable!("a finished fiber was rescheduled")
}

////////////////////////////////////////////////////////////////////////////////
// Parking
////////////////////////////////////////////////////////////////////////////////

/// Identifies one park of one fiber. Queue entries created under this ticket
/// become stale the moment the fiber parks again.
#[derive(Clone, Copy)]
pub(crate) struct ParkTicket {
    pub fiber: FiberHandle,
    pub seq: u64,
}

/// Open a park: bump the sequence number so that entries from any previous
/// park of this fiber are dead from here on.
pub(crate) fn begin_park() -> ParkTicket {
    let rt = runtime();
    let cur = rt.current;
    let cb = rt.cb_mut(cur);
    cb.park_seq += 1;
    ParkTicket {
        fiber: cur,
        seq: cb.park_seq,
    }
}

/// Block the current fiber under `ticket`, arm the deadline timer and hand
/// the thread over. Returns once a wakeup was delivered.
pub(crate) fn block_current(ticket: ParkTicket, regs: Vec<WaitReg>, deadline: Deadline) {
    {
        let rt = runtime();
        debug_assert_eq!(rt.current, ticket.fiber);
        if !deadline.is_never() {
            rt.timers.push(Reverse(TimerEntry {
                at: deadline.millis(),
                fiber: ticket.fiber,
                seq: ticket.seq,
            }));
        }
        let cb = rt.cb_mut(ticket.fiber);
        debug_assert_eq!(cb.park_seq, ticket.seq);
        cb.state = State::Blocked;
        cb.wake_reason = None;
        cb.regs = regs;
    }
    schedule();
}

/// Collect the wake reason and the wait-set unlink handles after a resume.
pub(crate) fn take_wakeup() -> (Wake, Vec<WaitReg>) {
    let rt = runtime();
    let cur = rt.current;
    let cb = rt.cb_mut(cur);
    let reason = cb.wake_reason.take().expect("resumed without a wake reason");
    (reason, std::mem::take(&mut cb.regs))
}

/// Deliver a wakeup. A no-op unless the fiber is currently blocked; the
/// first wakeup wins and later ones are dropped.
pub(crate) fn wake(h: FiberHandle, reason: Wake) {
    runtime().wake(h, reason);
}

fn slot_parked(fibers: &[FiberSlot], fiber: FiberHandle, seq: u64) -> bool {
    fibers.get(fiber.index as usize).map_or(false, |slot| {
        slot.gen == fiber.gen
            && slot
                .cb
                .as_ref()
                .map_or(false, |cb| cb.state == State::Blocked && cb.park_seq == seq)
    })
}

/// Whether a queue entry created under (`fiber`, `seq`) still belongs to a
/// live park.
pub(crate) fn waiter_is_current(fiber: FiberHandle, seq: u64) -> bool {
    slot_parked(&runtime().fibers, fiber, seq)
}

pub(crate) fn unlink_fd_waiter(fd: RawFd, events: FdEvents, fiber: FiberHandle) {
    runtime().poller.clear_waiter(fd, events, fiber);
}

/// Busy-check an fd registration. The parked-ness predicate is resolved
/// here, against the same runtime borrow that yields the poller, so the
/// poller never re-enters the scheduler.
pub(crate) fn fd_check_free(fd: RawFd, events: FdEvents) -> Result<(), Error> {
    let rt = runtime();
    let Runtime {
        ref poller,
        ref fibers,
        ..
    } = *rt;
    poller.check_free(fd, events, &|fiber, seq| slot_parked(fibers, fiber, seq))
}

pub(crate) fn fd_register(fd: RawFd, events: FdEvents, ticket: ParkTicket, slot: *mut u8) {
    runtime().poller.register(fd, events, ticket, slot);
}

pub(crate) fn with_poller<R>(f: impl FnOnce(&mut Poller) -> R) -> R {
    f(&mut runtime().poller)
}

////////////////////////////////////////////////////////////////////////////////
// Current-fiber accessors
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn current_handle() -> FiberHandle {
    runtime().current
}

pub(crate) fn current_is_cancelled() -> bool {
    let rt = runtime();
    let cur = rt.current;
    rt.cb_mut(cur).cancelled
}

pub(crate) fn current_csw() -> u64 {
    let rt = runtime();
    let cur = rt.current;
    rt.cb_mut(cur).csw
}

fn current_name() -> String {
    let rt = runtime();
    let cur = rt.current;
    rt.cb_mut(cur).name.clone()
}

pub(crate) fn local_ptr() -> *mut c_void {
    let rt = runtime();
    let cur = rt.current;
    rt.cb_mut(cur).local
}

pub(crate) fn set_local_ptr(p: *mut c_void) {
    let rt = runtime();
    let cur = rt.current;
    rt.cb_mut(cur).local = p;
}

pub(crate) fn cached_now() -> i64 {
    runtime().now_cache
}

////////////////////////////////////////////////////////////////////////////////
// Cancellation support
////////////////////////////////////////////////////////////////////////////////

pub(crate) fn fiber_is_live(h: FiberHandle) -> bool {
    runtime().cb_opt(h).is_some()
}

pub(crate) fn fiber_is_finished(h: FiberHandle) -> bool {
    runtime()
        .cb_opt(h)
        .map_or(false, |cb| cb.state == State::Finished)
}

/// Subscribe the canceller's park to the target's exit notification. The
/// notification fires only while that exact park is still in effect, so a
/// canceller re-registers before each of its parks.
pub(crate) fn set_exit_waiter(h: FiberHandle, ticket: ParkTicket) {
    if let Some(cb) = runtime().cb_opt_mut(h) {
        if cb.state != State::Finished {
            debug_assert!(
                cb.exit_waiter.map_or(true, |(w, _)| w == ticket.fiber),
                "fiber is being reaped by two cancellers"
            );
            cb.exit_waiter = Some((ticket.fiber, ticket.seq));
        }
    }
}

/// Set the sticky cancel flag; a blocked target is woken so that its current
/// blocking call returns `Cancelled` on resume.
pub(crate) fn flag_cancel(h: FiberHandle) {
    let rt = runtime();
    let blocked = match rt.cb_opt_mut(h) {
        Some(cb) if cb.state != State::Finished => {
            cb.cancelled = true;
            cb.state == State::Blocked
        }
        _ => false,
    };
    if blocked {
        rt.wake(h, Wake::Cancelled);
    }
}

/// Free a finished fiber: return its stack to the pool and invalidate the
/// handle. The slot index is recycled under a new generation.
pub(crate) fn reap_fiber(h: FiberHandle) {
    let rt = runtime();
    let slot = &mut rt.fibers[h.index as usize];
    debug_assert_eq!(slot.gen, h.gen, "reaping through a stale handle");
    let cb = slot.cb.take().expect("reaping an empty slot");
    debug_assert_eq!(cb.state, State::Finished, "reaping a live fiber");
    log::trace!("reap fiber '{}'", cb.name);
    slot.gen = slot.gen.wrapping_add(1);
    rt.free_slots.push(h.index);
    if let Some(stack) = cb.stack {
        rt.stacks.release(stack);
    }
}
