//! Typed bounded channels between fibers.
//!
//! A [`Channel<T>`] is a FIFO with a fixed capacity; capacity `0` makes it a
//! rendezvous point where every send pairs with exactly one receive. The
//! handle is reference-counted: [`Clone`] produces another handle to the
//! same underlying channel and the channel is freed when the last handle
//! (and the last parked waiter) goes away.
//!
//! A channel can be switched into the terminal **done** state with
//! [`Channel::done`]: all parked senders fail, all parked receivers - and
//! every receiver that comes later - observe a copy of the final value.
//! A done channel is a broadcast of a sentinel, which is why the receiving
//! operations require `T: Clone`.
//!
//! Two invariants hold at every suspension boundary:
//! - senders and receivers are never parked simultaneously (a waiting
//!   partner would have been completed on the spot);
//! - a done channel has no parked waiters at all.
//!
//! Blocking variants accept an absolute [`Deadline`]; a timed out or
//! cancelled operation has consumed nothing and delivered nothing.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::choose::ChooseTarget;
use crate::clock::Deadline;
use crate::error::Error;
use crate::fiber::sched;
use crate::fiber::wait::{self, WaitQueue, WaitReg, Waiter, Wake};

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

/// A handle to a typed bounded channel. Cloning the handle is cheap and
/// shares the underlying channel.
pub struct Channel<T> {
    shared: Rc<ChanShared<T>>,
}

impl<T: 'static> Channel<T> {
    /// Create a channel holding up to `capacity` buffered items. With
    /// capacity `0` every send rendezvouses with a receive.
    pub fn new(capacity: usize) -> Self {
        Channel {
            shared: Rc::new(ChanShared {
                state: RefCell::new(ChanState {
                    cap: capacity,
                    buf: VecDeque::with_capacity(capacity),
                    senders: VecDeque::new(),
                    receivers: VecDeque::new(),
                    done: None,
                }),
            }),
        }
    }

    /// Send a message, blocking while the channel is full.
    ///
    /// On failure the message travels back to the caller inside the error.
    /// This function may perform a **yield** when no receiver is ready and
    /// the buffer is full.
    #[inline]
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.send_deadline(value, Deadline::NEVER)
    }

    /// Like [`send`](Self::send), but gives up at the absolute `deadline`.
    pub fn send_deadline(
        &self,
        value: T,
        deadline: impl Into<Deadline>,
    ) -> Result<(), SendError<T>> {
        let deadline = deadline.into();
        if !deadline.is_probe() && sched::current_is_cancelled() {
            return Err(SendError::Cancelled(value));
        }
        let mut value = value;
        loop {
            value = match self.shared.complete_send(value) {
                Ok(()) => return Ok(()),
                Err(SendAttempt::Done(v)) => return Err(SendError::Done(v)),
                Err(SendAttempt::Full(v)) => v,
            };
            if deadline.is_probe() {
                return Err(SendError::Timeout(value));
            }

            // Park as a sender; the slot hands the value over to whichever
            // receiver completes us.
            let mut slot = Some(value);
            let ticket = sched::begin_park();
            self.shared.state.borrow_mut().senders.push_back(Waiter {
                fiber: ticket.fiber,
                clause: 0,
                seq: ticket.seq,
                slot: (&mut slot as *mut Option<T>).cast(),
            });
            let queue: Rc<dyn WaitQueue> = self.shared.clone();
            let regs = vec![WaitReg::Queue(queue)];
            match wait::park(ticket, regs, deadline) {
                Wake::Fired(_) => match slot.take() {
                    // A receiver took the value.
                    None => return Ok(()),
                    // Woken with the value still in hand: the channel went
                    // done under us. Loop back to report it.
                    Some(v) => value = v,
                },
                Wake::Timeout => {
                    let v = slot.take().expect("value vanished on timeout");
                    return Err(SendError::Timeout(v));
                }
                Wake::Cancelled => {
                    let v = slot.take().expect("value vanished on cancel");
                    return Err(SendError::Cancelled(v));
                }
                wake => unreachable!("channel send woken by {:?}", wake),
            };
        }
    }

    /// Send without blocking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        match self.shared.complete_send(value) {
            Ok(()) => Ok(()),
            Err(SendAttempt::Done(v)) => Err(TrySendError::Done(v)),
            Err(SendAttempt::Full(v)) => Err(TrySendError::Full(v)),
        }
    }

    /// Receive a message, blocking while the channel is empty.
    ///
    /// On a done channel this returns a copy of the final value without
    /// blocking, any number of times. May perform a **yield**.
    #[inline]
    pub fn recv(&self) -> Result<T, RecvError>
    where
        T: Clone,
    {
        self.recv_deadline(Deadline::NEVER)
    }

    /// Like [`recv`](Self::recv), but gives up at the absolute `deadline`.
    pub fn recv_deadline(&self, deadline: impl Into<Deadline>) -> Result<T, RecvError>
    where
        T: Clone,
    {
        let deadline = deadline.into();
        if !deadline.is_probe() && sched::current_is_cancelled() {
            return Err(RecvError::Cancelled);
        }
        if let Some(v) = self.shared.complete_recv() {
            return Ok(v);
        }
        if deadline.is_probe() {
            return Err(RecvError::Timeout);
        }

        let mut slot: Option<T> = None;
        let ticket = sched::begin_park();
        self.shared.state.borrow_mut().receivers.push_back(Waiter {
            fiber: ticket.fiber,
            clause: 0,
            seq: ticket.seq,
            slot: (&mut slot as *mut Option<T>).cast(),
        });
        let queue: Rc<dyn WaitQueue> = self.shared.clone();
        let regs = vec![WaitReg::Queue(queue)];
        match wait::park(ticket, regs, deadline) {
            Wake::Fired(_) => Ok(slot.take().expect("receiver woken with an empty slot")),
            Wake::Timeout => Err(RecvError::Timeout),
            Wake::Cancelled => Err(RecvError::Cancelled),
            wake => unreachable!("channel recv woken by {:?}", wake),
        }
    }

    /// Receive without blocking. `None` means the channel is empty (and not
    /// done).
    pub fn try_recv(&self) -> Option<T>
    where
        T: Clone,
    {
        self.shared.complete_recv()
    }

    /// Switch the channel into the terminal done state, broadcasting
    /// `value`.
    ///
    /// Every parked sender fails with [`SendError::Done`]; every parked
    /// receiver, and every receive from now on, observes a copy of `value`.
    /// Does not yield. Calling `done` twice fails with
    /// [`Error::Pipe`](crate::Error::Pipe).
    pub fn done(&self, value: T) -> Result<(), Error>
    where
        T: Clone,
    {
        self.shared.complete_done(value)
    }

    /// Whether [`done`](Self::done) was called on this channel.
    pub fn is_done(&self) -> bool {
        self.shared.state.borrow().done.is_some()
    }

    /// Number of items sitting in the buffer.
    pub fn len(&self) -> usize {
        self.shared.state.borrow().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffer capacity this channel was created with.
    pub fn capacity(&self) -> usize {
        self.shared.state.borrow().cap
    }

    pub(crate) fn shared(&self) -> Rc<ChanShared<T>> {
        self.shared.clone()
    }
}

impl<T> Clone for Channel<T> {
    /// Another handle to the same channel.
    fn clone(&self) -> Self {
        Channel {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let st = self.shared.state.borrow();
        f.debug_struct("Channel")
            .field("capacity", &st.cap)
            .field("len", &st.buf.len())
            .field("done", &st.done.is_some())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Shared state
////////////////////////////////////////////////////////////////////////////////

pub(crate) struct ChanShared<T> {
    state: RefCell<ChanState<T>>,
}

struct ChanState<T> {
    cap: usize,
    buf: VecDeque<T>,
    senders: VecDeque<Waiter>,
    receivers: VecDeque<Waiter>,
    /// The latched final value; `Some` means the channel is done.
    done: Option<T>,
}

/// Outcome of a non-blocking send attempt, handing the value back.
enum SendAttempt<T> {
    Full(T),
    Done(T),
}

impl<T> ChanShared<T> {
    /// Attempt an immediate send: complete a parked receiver or buffer the
    /// value. Returns the value on the slow path.
    fn complete_send(&self, value: T) -> Result<(), SendAttempt<T>> {
        let mut st = self.state.borrow_mut();
        if st.done.is_some() {
            return Err(SendAttempt::Done(value));
        }
        while let Some(w) = st.receivers.pop_front() {
            if !w.is_current() {
                continue;
            }
            unsafe { *w.slot.cast::<Option<T>>() = Some(value) };
            sched::wake(w.fiber, Wake::Fired(w.clause));
            return Ok(());
        }
        if st.buf.len() < st.cap {
            st.buf.push_back(value);
            return Ok(());
        }
        Err(SendAttempt::Full(value))
    }

    /// Attempt an immediate receive: buffer head, a parked sender's value,
    /// or the done sentinel - in that order, which preserves FIFO over the
    /// logical channel.
    fn complete_recv(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut st = self.state.borrow_mut();
        if let Some(v) = st.buf.pop_front() {
            // The freed buffer slot goes to the earliest parked sender.
            while let Some(w) = st.senders.pop_front() {
                if !w.is_current() {
                    continue;
                }
                let refill = unsafe {
                    (*w.slot.cast::<Option<T>>())
                        .take()
                        .expect("parked sender with an empty slot")
                };
                st.buf.push_back(refill);
                sched::wake(w.fiber, Wake::Fired(w.clause));
                break;
            }
            return Some(v);
        }
        while let Some(w) = st.senders.pop_front() {
            if !w.is_current() {
                continue;
            }
            let v = unsafe {
                (*w.slot.cast::<Option<T>>())
                    .take()
                    .expect("parked sender with an empty slot")
            };
            sched::wake(w.fiber, Wake::Fired(w.clause));
            return Some(v);
        }
        st.done.as_ref().cloned()
    }

    fn complete_done(&self, value: T) -> Result<(), Error>
    where
        T: Clone,
    {
        let mut st = self.state.borrow_mut();
        if st.done.is_some() {
            return Err(Error::Pipe);
        }
        while let Some(w) = st.receivers.pop_front() {
            if !w.is_current() {
                continue;
            }
            unsafe { *w.slot.cast::<Option<T>>() = Some(value.clone()) };
            sched::wake(w.fiber, Wake::Fired(w.clause));
        }
        // Parked senders keep their values; they observe the done state
        // when they resume.
        while let Some(w) = st.senders.pop_front() {
            if !w.is_current() {
                continue;
            }
            sched::wake(w.fiber, Wake::Fired(w.clause));
        }
        st.done = Some(value);
        Ok(())
    }

    pub(crate) fn enqueue_sender(&self, w: Waiter) {
        self.state.borrow_mut().senders.push_back(w);
    }

    pub(crate) fn enqueue_receiver(&self, w: Waiter) {
        self.state.borrow_mut().receivers.push_back(w);
    }
}

impl<T> WaitQueue for ChanShared<T> {
    fn unlink(&self, fiber: crate::fiber::FiberHandle) {
        let mut st = self.state.borrow_mut();
        st.senders.retain(|w| w.fiber != fiber);
        st.receivers.retain(|w| w.fiber != fiber);
    }
}

impl<T> Drop for ChanShared<T> {
    fn drop(&mut self) {
        // A parked waiter holds a strong reference through its wait set, so
        // the last handle cannot go away while anything is parked here.
        let st = self.state.get_mut();
        debug_assert!(st.senders.is_empty(), "channel dropped with parked senders");
        debug_assert!(
            st.receivers.is_empty(),
            "channel dropped with parked receivers"
        );
    }
}

////////////////////////////////////////////////////////////////////////////////
// Multiplexing hooks
////////////////////////////////////////////////////////////////////////////////

impl<T> ChooseTarget for ChanShared<T>
where
    T: Clone + 'static,
{
    fn token(&self) -> usize {
        self as *const Self as *const () as usize
    }

    fn send_ready(&self) -> bool {
        let st = self.state.borrow();
        st.done.is_some()
            || st.buf.len() < st.cap
            || st.receivers.iter().any(|w| w.is_current())
    }

    fn recv_ready(&self) -> bool {
        let st = self.state.borrow();
        !st.buf.is_empty() || st.done.is_some() || st.senders.iter().any(|w| w.is_current())
    }

    fn fire_send(&self, slot: *mut u8) -> bool {
        let value = unsafe {
            (*slot.cast::<Option<T>>())
                .take()
                .expect("send clause fired twice")
        };
        match self.complete_send(value) {
            Ok(()) => true,
            Err(SendAttempt::Done(v)) => {
                // The channel refuses the value; leave it in the clause for
                // the caller to recover.
                unsafe { *slot.cast::<Option<T>>() = Some(v) };
                false
            }
            Err(SendAttempt::Full(_)) => unreachable!("send clause fired while not ready"),
        }
    }

    fn fire_recv(&self, slot: *mut u8) {
        let v = self
            .complete_recv()
            .expect("recv clause fired while not ready");
        unsafe { *slot.cast::<Option<T>>() = Some(v) };
    }

    fn enqueue_send_waiter(&self, w: Waiter) {
        self.enqueue_sender(w);
    }

    fn enqueue_recv_waiter(&self, w: Waiter) {
        self.enqueue_receiver(w);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Errors
////////////////////////////////////////////////////////////////////////////////

/// A failed send. The undelivered value travels back inside the error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendError<T> {
    /// The channel is done and accepts no further messages.
    Done(T),
    /// The deadline passed with the channel still full.
    Timeout(T),
    /// The calling fiber was cancelled.
    Cancelled(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Done(v) | Self::Timeout(v) | Self::Cancelled(v) => v,
        }
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Done(_) => Error::Pipe,
            SendError::Timeout(_) => Error::TimedOut,
            SendError::Cancelled(_) => Error::Cancelled,
        }
    }
}

/// A failed non-blocking send.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TrySendError<T> {
    /// No receiver is parked and the buffer is full.
    Full(T),
    /// The channel is done and accepts no further messages.
    Done(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(v) | Self::Done(v) => v,
        }
    }
}

impl<T> From<TrySendError<T>> for Error {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => Error::TimedOut,
            TrySendError::Done(_) => Error::Pipe,
        }
    }
}

/// A failed receive.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecvError {
    /// The deadline passed with the channel still empty.
    Timeout,
    /// The calling fiber was cancelled.
    Cancelled,
}

impl From<RecvError> for Error {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Timeout => Error::TimedOut,
            RecvError::Cancelled => Error::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Channel;

    #[test]
    fn observers() {
        let ch = Channel::<i32>::new(2);
        assert_eq!(ch.capacity(), 2);
        assert_eq!(ch.len(), 0);
        assert!(ch.is_empty());
        assert!(!ch.is_done());

        ch.try_send(1).unwrap();
        assert_eq!(ch.len(), 1);

        let dup = ch.clone();
        assert_eq!(dup.len(), 1);
        assert_eq!(dup.try_recv(), Some(1));
        assert_eq!(ch.len(), 0);
    }

    #[test]
    fn done_latches() {
        let ch = Channel::<i32>::new(0);
        ch.done(-1).unwrap();
        assert!(ch.is_done());
        assert!(ch.done(-2).is_err());
        assert_eq!(ch.try_recv(), Some(-1));
        assert_eq!(ch.try_recv(), Some(-1));
    }
}
