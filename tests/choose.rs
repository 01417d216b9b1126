use std::time::{Duration, Instant};

use spindle::channel::Channel;
use spindle::choose::{choose, Clause};
use spindle::clock::Deadline;
use spindle::fiber;
use spindle::Error;

#[test]
fn recv_with_timeout_expires() {
    let ch = Channel::<i32>::new(0);
    let mut out = None;

    let t0 = Instant::now();
    let mut clauses = [Clause::recv(&ch, &mut out)];
    let err = choose(&mut clauses, Deadline::after_ms(100)).unwrap_err();
    drop(clauses);

    assert!(matches!(err, Error::TimedOut));
    assert!(t0.elapsed() >= Duration::from_millis(95));
    assert_eq!(out, None);
}

#[test]
fn fires_the_clause_whose_partner_arrives() {
    let a = Channel::<i32>::new(0);
    let b = Channel::<i32>::new(0);
    let tx = b.clone();
    let h = fiber::spawn(move || tx.send(42).unwrap()).unwrap();

    let mut from_a = None;
    let mut from_b = None;
    let mut clauses = [Clause::recv(&a, &mut from_a), Clause::recv(&b, &mut from_b)];
    let fired = choose(&mut clauses, Deadline::after_ms(1000)).unwrap();
    drop(clauses);

    assert_eq!(fired, 1);
    assert_eq!(from_b, Some(42));
    assert_eq!(from_a, None);

    fiber::cancel(&[h], Deadline::after_ms(1000)).unwrap();
}

#[test]
fn immediate_pick_among_ready_clauses() {
    let a = Channel::<i32>::new(1);
    let b = Channel::<i32>::new(1);

    let mut clauses = vec![Clause::send(&a, 1), Clause::send(&b, 2)];
    let fired = choose(&mut clauses, Deadline::PROBE).unwrap();

    // Exactly one clause took effect.
    assert!(fired < 2);
    assert_eq!(a.len() + b.len(), 1);
    let unfired = clauses.remove(1 - fired);
    let fired_clause = clauses.remove(0);
    assert_eq!(fired_clause.into_value::<i32>(), None);
    assert_eq!(unfired.into_value::<i32>(), Some(if fired == 0 { 2 } else { 1 }));
}

#[test]
fn probe_with_nothing_ready_times_out() {
    let ch = Channel::<i32>::new(0);
    let mut out = None;
    let mut clauses = [Clause::recv(&ch, &mut out)];
    assert!(matches!(
        choose(&mut clauses, Deadline::PROBE).unwrap_err(),
        Error::TimedOut
    ));
}

#[test]
fn opposite_clauses_on_one_channel_are_rejected() {
    let ch = Channel::<i32>::new(0);
    let mut out = None;
    let mut clauses = [Clause::send(&ch, 1), Clause::recv(&ch, &mut out)];
    assert!(matches!(
        choose(&mut clauses, Deadline::NEVER).unwrap_err(),
        Error::InvalidArg(_)
    ));
}

#[test]
fn send_clause_on_done_channel_fires_but_keeps_the_value() {
    let ch = Channel::<i32>::new(0);
    ch.done(0).unwrap();

    let mut clauses = vec![Clause::send(&ch, 5)];
    let fired = choose(&mut clauses, Deadline::NEVER).unwrap();
    assert_eq!(fired, 0);
    // The channel refused the message; the caller can take it back.
    assert_eq!(clauses.pop().unwrap().into_value::<i32>(), Some(5));
}

#[test]
fn parked_send_clause_completes_against_a_receiver() {
    let ch = Channel::<i32>::new(0);
    let rx = ch.clone();
    let h = fiber::spawn(move || assert_eq!(rx.recv().unwrap(), 9)).unwrap();

    let mut clauses = vec![Clause::send(&ch, 9)];
    let fired = choose(&mut clauses, Deadline::after_ms(1000)).unwrap();
    assert_eq!(fired, 0);
    assert_eq!(clauses.pop().unwrap().into_value::<i32>(), None);

    fiber::cancel(&[h], Deadline::after_ms(1000)).unwrap();
}

#[test]
fn done_completes_parked_recv_clause() {
    let ch = Channel::<i32>::new(0);
    let tx = ch.clone();
    let h = fiber::spawn(move || tx.done(-7).unwrap()).unwrap();

    let mut out = None;
    let mut clauses = [Clause::recv(&ch, &mut out)];
    let fired = choose(&mut clauses, Deadline::after_ms(1000)).unwrap();
    drop(clauses);
    assert_eq!(fired, 0);
    assert_eq!(out, Some(-7));

    fiber::cancel(&[h], Deadline::after_ms(1000)).unwrap();
}
