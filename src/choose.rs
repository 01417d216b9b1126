//! Waiting on several channel operations at once.
//!
//! [`choose`] takes a set of [`Clause`]s - each a potential send or receive
//! on its own channel - and completes exactly one of them. When several
//! clauses are ready on entry the winner is picked uniformly at random, so
//! no channel can starve its peers by being listed first; once the fiber
//! parks, strict queue FIFO decides.
//!
//! A receive clause delivers into the `Option` slot supplied at
//! construction. A send clause owns its value for the duration of the call;
//! if the clause did not fire (or its channel turned out to be done, which
//! also fires the clause but refuses the message) the value can be taken
//! back with [`Clause::into_value`].
//!
//! # Example
//!
//! ```no_run
//! use spindle::channel::Channel;
//! use spindle::choose::{choose, Clause};
//! use spindle::clock::Deadline;
//!
//! let a = Channel::<i32>::new(0);
//! let b = Channel::<i32>::new(1);
//! let mut got = None;
//! let mut clauses = [Clause::recv(&a, &mut got), Clause::send(&b, 9)];
//! let fired = choose(&mut clauses, Deadline::after_ms(100));
//! drop(clauses);
//! match fired {
//!     Ok(0) => println!("received {:?}", got),
//!     Ok(_) => println!("sent"),
//!     Err(e) => println!("neither: {}", e),
//! }
//! ```

use std::any::Any;
use std::marker::PhantomData;
use std::rc::Rc;

use rand::Rng;

use crate::channel::Channel;
use crate::clock::Deadline;
use crate::error::{Error, Result};
use crate::fiber::sched;
use crate::fiber::wait::{self, WaitQueue, WaitReg, Waiter, Wake};

/// Channel-side hooks used by the multiplexer. Implemented by the channel's
/// shared state; object-safe so one clause array can span item types.
pub(crate) trait ChooseTarget {
    /// Identity of the underlying channel, for conflict detection.
    fn token(&self) -> usize;
    fn send_ready(&self) -> bool;
    fn recv_ready(&self) -> bool;
    /// Perform a ready send out of `slot`. `false` means the channel is
    /// done and the value stays in the slot.
    fn fire_send(&self, slot: *mut u8) -> bool;
    /// Perform a ready receive into `slot`.
    fn fire_recv(&self, slot: *mut u8);
    fn enqueue_send_waiter(&self, w: Waiter);
    fn enqueue_recv_waiter(&self, w: Waiter);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClauseKind {
    Send,
    Recv,
}

/// One alternative of a [`choose`] call.
pub struct Clause<'a> {
    target: Rc<dyn ChooseTarget>,
    queue: Rc<dyn WaitQueue>,
    kind: ClauseKind,
    /// Points either into `storage` (send) or at the caller's out slot
    /// (recv); valid for as long as the clause lives.
    slot: *mut u8,
    storage: Option<Box<dyn Any>>,
    _marker: PhantomData<&'a mut ()>,
}

impl<'a> Clause<'a> {
    /// A clause that sends `value` into `ch`.
    pub fn send<T>(ch: &'a Channel<T>, value: T) -> Self
    where
        T: Clone + 'static,
    {
        let mut storage: Box<Option<T>> = Box::new(Some(value));
        let slot = (&mut *storage as *mut Option<T>).cast::<u8>();
        let storage: Box<dyn Any> = storage;
        Clause {
            target: ch.shared(),
            queue: ch.shared(),
            kind: ClauseKind::Send,
            slot,
            storage: Some(storage),
            _marker: PhantomData,
        }
    }

    /// A clause that receives from `ch` into `out`.
    ///
    /// `out` is cleared on construction; after the clause fires it holds
    /// `Some(message)`.
    pub fn recv<T>(ch: &'a Channel<T>, out: &'a mut Option<T>) -> Self
    where
        T: Clone + 'static,
    {
        *out = None;
        Clause {
            target: ch.shared(),
            queue: ch.shared(),
            kind: ClauseKind::Recv,
            slot: (out as *mut Option<T>).cast::<u8>(),
            storage: None,
            _marker: PhantomData,
        }
    }

    /// Recover the value of a send clause that did not deliver: one that
    /// never fired, or one whose channel was done. `None` for receive
    /// clauses and for sends that went through.
    pub fn into_value<T: 'static>(self) -> Option<T> {
        let storage = self.storage?;
        match storage.downcast::<Option<T>>() {
            Ok(slot) => *slot,
            Err(_) => None,
        }
    }

    fn ready(&self) -> bool {
        match self.kind {
            ClauseKind::Send => self.target.send_ready(),
            ClauseKind::Recv => self.target.recv_ready(),
        }
    }

    fn fire(&self) {
        match self.kind {
            ClauseKind::Send => {
                self.target.fire_send(self.slot);
            }
            ClauseKind::Recv => self.target.fire_recv(self.slot),
        }
    }
}

impl std::fmt::Debug for Clause<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Clause").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// Block until one of `clauses` completes and return its index.
///
/// The firing clause has already taken its effect when the call returns:
/// a send clause has delivered its value (unless the channel was done, see
/// [`Clause::into_value`]) and a receive clause has filled its out slot.
/// No other clause has any observable effect.
///
/// With `Deadline::PROBE` the call never parks; with no clause ready it
/// reports [`Error::TimedOut`] - the same error an armed deadline produces
/// when it expires first.
///
/// Listing the same channel in a send and a receive clause of one call is
/// rejected with [`Error::InvalidArg`], as the pair could rendezvous with
/// itself.
pub fn choose(clauses: &mut [Clause<'_>], deadline: impl Into<Deadline>) -> Result<usize> {
    let deadline = deadline.into();
    if !deadline.is_probe() && sched::current_is_cancelled() {
        return Err(Error::Cancelled);
    }
    for (i, a) in clauses.iter().enumerate() {
        for b in &clauses[..i] {
            if a.target.token() == b.target.token() && a.kind != b.kind {
                return Err(Error::InvalidArg(
                    "send and receive clauses on the same channel",
                ));
            }
        }
    }

    // Immediate pass: pick uniformly among the ready clauses.
    let ready: Vec<usize> = clauses
        .iter()
        .enumerate()
        .filter(|(_, c)| c.ready())
        .map(|(i, _)| i)
        .collect();
    if !ready.is_empty() {
        let pick = if ready.len() == 1 {
            ready[0]
        } else {
            ready[rand::thread_rng().gen_range(0..ready.len())]
        };
        clauses[pick].fire();
        return Ok(pick);
    }
    if deadline.is_probe() {
        return Err(Error::TimedOut);
    }

    let ticket = sched::begin_park();
    let mut regs = Vec::with_capacity(clauses.len());
    for (i, c) in clauses.iter().enumerate() {
        let w = Waiter {
            fiber: ticket.fiber,
            clause: i,
            seq: ticket.seq,
            slot: c.slot,
        };
        match c.kind {
            ClauseKind::Send => c.target.enqueue_send_waiter(w),
            ClauseKind::Recv => c.target.enqueue_recv_waiter(w),
        }
        regs.push(WaitReg::Queue(c.queue.clone()));
    }
    match wait::park(ticket, regs, deadline) {
        Wake::Fired(i) => Ok(i),
        Wake::Timeout => Err(Error::TimedOut),
        Wake::Cancelled => Err(Error::Cancelled),
        wake => unreachable!("choose woken by {:?}", wake),
    }
}
