use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use spindle::channel::{Channel, RecvError, SendError, TrySendError};
use spindle::clock::Deadline;
use spindle::fiber::{self, YieldResult};

#[test]
fn unbuffered_rendezvous() {
    let ch = Channel::<i32>::new(0);
    let tx = ch.clone();
    let rx = ch.clone();
    let got = Rc::new(Cell::new(0));

    let out = got.clone();
    let a = fiber::spawn(move || tx.send(7).unwrap()).unwrap();
    let b = fiber::spawn(move || out.set(rx.recv().unwrap())).unwrap();

    fiber::cancel(&[a, b], Deadline::after_ms(1000)).unwrap();
    assert_eq!(got.get(), 7);
}

#[test]
fn buffered_overflow_preserves_order() {
    let ch = Channel::<i32>::new(2);
    let rx = ch.clone();
    let got = Rc::new(RefCell::new(Vec::new()));

    let out = got.clone();
    let h = fiber::spawn(move || {
        for _ in 0..3 {
            out.borrow_mut().push(rx.recv().unwrap());
        }
    })
    .unwrap();

    // Two sends fit the buffer without yielding; the third parks until the
    // receiver drains.
    assert_eq!(
        fiber::check_yield(|| ch.send(1).unwrap()),
        YieldResult::DidntYield(())
    );
    assert_eq!(
        fiber::check_yield(|| ch.send(2).unwrap()),
        YieldResult::DidntYield(())
    );
    assert_eq!(
        fiber::check_yield(|| ch.send(3).unwrap()),
        YieldResult::Yielded(())
    );

    fiber::cancel(&[h], Deadline::after_ms(1000)).unwrap();
    assert_eq!(*got.borrow(), vec![1, 2, 3]);
}

#[test]
fn parked_senders_complete_in_fifo_order() {
    let ch = Channel::<i32>::new(0);
    let tx1 = ch.clone();
    let tx2 = ch.clone();

    let s1 = fiber::spawn(move || tx1.send(1).unwrap()).unwrap();
    let s2 = fiber::spawn(move || tx2.send(2).unwrap()).unwrap();
    fiber::yield_now().unwrap(); // both park, in spawn order

    assert_eq!(ch.recv().unwrap(), 1);
    assert_eq!(ch.recv().unwrap(), 2);

    fiber::cancel(&[s1, s2], Deadline::after_ms(1000)).unwrap();
}

#[test]
fn done_broadcasts_to_parked_and_future_receivers() {
    let ch = Channel::<i32>::new(0);
    let got = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let rx = ch.clone();
        let out = got.clone();
        handles.push(fiber::spawn(move || out.borrow_mut().push(rx.recv().unwrap())).unwrap());
    }
    fiber::yield_now().unwrap(); // both receivers park

    ch.done(-1).unwrap();

    // The channel now refuses messages...
    assert_eq!(ch.try_send(5), Err(TrySendError::Done(5)));
    assert_eq!(ch.send(6), Err(SendError::Done(6)));
    // ...and `done` cannot be applied twice.
    assert!(ch.done(-2).is_err());

    fiber::cancel(&handles, Deadline::after_ms(1000)).unwrap();
    assert_eq!(*got.borrow(), vec![-1, -1]);

    // Every future receive observes the latched value without blocking.
    assert_eq!(
        fiber::check_yield(|| ch.recv()),
        YieldResult::DidntYield(Ok(-1))
    );
    assert_eq!(
        fiber::check_yield(|| ch.recv()),
        YieldResult::DidntYield(Ok(-1))
    );
}

#[test]
fn send_full_and_recv_empty() {
    let ch = Channel::<&'static str>::new(0);

    assert_eq!(
        fiber::check_yield(|| ch
            .send_deadline("echo1", Deadline::after_ms(1))
            .unwrap_err()),
        YieldResult::Yielded(SendError::Timeout("echo1"))
    );
    assert_eq!(
        fiber::check_yield(|| ch.try_send("echo2").unwrap_err()),
        YieldResult::DidntYield(TrySendError::Full("echo2"))
    );
    assert_eq!(
        fiber::check_yield(|| ch.recv_deadline(Deadline::after_ms(1)).unwrap_err()),
        YieldResult::Yielded(RecvError::Timeout)
    );
    assert_eq!(
        fiber::check_yield(|| ch.try_recv()),
        YieldResult::DidntYield(None)
    );
}

#[test]
fn send_to_self_through_buffer() {
    let ch = Channel::<&'static str>::new(1);
    ch.send("hello").unwrap();
    assert_eq!(ch.recv().unwrap(), "hello");
}

#[test]
fn timeout_consumes_nothing() {
    let ch = Channel::<i32>::new(0);

    let t0 = Instant::now();
    let err = ch.send_deadline(5, Deadline::after_ms(40)).unwrap_err();
    assert_eq!(err, SendError::Timeout(5));
    assert!(t0.elapsed() >= Duration::from_millis(35));

    // The timed out send left no trace: the channel is still empty and a
    // later rendezvous pairs with the new message only.
    assert_eq!(ch.try_recv(), None);

    let rx = ch.clone();
    let got = Rc::new(Cell::new(0));
    let out = got.clone();
    let h = fiber::spawn(move || out.set(rx.recv().unwrap())).unwrap();
    ch.send(9).unwrap();
    fiber::cancel(&[h], Deadline::after_ms(1000)).unwrap();
    assert_eq!(got.get(), 9);
}

#[test]
fn recv_timeout_leaves_later_sends_intact() {
    let ch = Channel::<i32>::new(1);
    assert_eq!(
        ch.recv_deadline(Deadline::after_ms(20)).unwrap_err(),
        RecvError::Timeout
    );
    ch.send(1).unwrap();
    assert_eq!(ch.recv().unwrap(), 1);
}

#[test]
fn dup_shares_the_channel() {
    let ch = Channel::<i32>::new(3);
    let dup = ch.clone();
    ch.send(1).unwrap();
    dup.send(2).unwrap();
    assert_eq!(ch.len(), 2);
    assert_eq!(dup.recv().unwrap(), 1);
    assert_eq!(ch.recv().unwrap(), 2);
    drop(dup);
    ch.send(3).unwrap();
    assert_eq!(ch.recv().unwrap(), 3);
}

#[test]
fn exactly_one_receiver_gets_each_message() {
    let ch = Channel::<i32>::new(0);
    let got = Rc::new(RefCell::new(Vec::new()));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let rx = ch.clone();
        let out = got.clone();
        handles.push(fiber::spawn(move || out.borrow_mut().push(rx.recv().unwrap())).unwrap());
    }
    fiber::yield_now().unwrap(); // both park

    ch.send(1).unwrap();
    ch.send(2).unwrap();

    fiber::cancel(&handles, Deadline::after_ms(1000)).unwrap();
    let mut seen = got.borrow().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2]);
}
