use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use spindle::clock::Deadline;
use spindle::fiber::{self, YieldResult};
use spindle::Error;

#[test]
fn grace_period_cancel() {
    // The target loops forever in short sleeps; only cancellation stops it.
    let seen = Rc::new(Cell::new(false));
    let flag = seen.clone();
    let h = fiber::spawn(move || loop {
        match fiber::sleep(Deadline::after_ms(10)) {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                flag.set(true);
                return;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
        if fiber::yield_now().is_err() {
            flag.set(true);
            return;
        }
    })
    .unwrap();

    let t0 = Instant::now();
    fiber::cancel(&[h], Deadline::after_ms(50)).unwrap();
    let elapsed = t0.elapsed();

    assert!(seen.get());
    assert!(elapsed >= Duration::from_millis(45), "grace was cut short");
    assert!(elapsed < Duration::from_millis(2000));
}

#[test]
fn cancel_finished_fiber_is_immediate() {
    let h = fiber::spawn(|| {}).unwrap();
    fiber::yield_now().unwrap();

    // Reaping an already-finished fiber does not suspend.
    assert_eq!(
        fiber::check_yield(|| fiber::cancel(&[h], Deadline::NEVER).unwrap()),
        YieldResult::DidntYield(())
    );
}

#[test]
fn handle_goes_stale_after_cancel() {
    let h = fiber::spawn(|| {}).unwrap();
    fiber::cancel(&[h], Deadline::after_ms(1000)).unwrap();

    let err = fiber::cancel(&[h], Deadline::NEVER).unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
}

#[test]
fn duplicate_handles_are_rejected() {
    let h = fiber::spawn(|| {}).unwrap();
    let err = fiber::cancel(&[h, h], Deadline::NEVER).unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
    fiber::cancel(&[h], Deadline::NEVER).unwrap();
}

#[test]
fn cancellation_is_sticky() {
    let results = Rc::new(RefCell::new(Vec::new()));
    let out = results.clone();
    let h = fiber::spawn(move || {
        // Parked forever until the owner cancels us.
        let first = fiber::sleep(Deadline::NEVER);
        out.borrow_mut().push(matches!(first, Err(Error::Cancelled)));
        // Every subsequent suspension point keeps failing...
        out.borrow_mut()
            .push(matches!(fiber::sleep(Deadline::after_ms(1)), Err(Error::Cancelled)));
        out.borrow_mut()
            .push(matches!(fiber::yield_now(), Err(Error::Cancelled)));
        out.borrow_mut().push(fiber::is_cancelled());
        // ...while non-suspending operations still work, so cleanup code
        // can run.
        let ch = spindle::channel::Channel::<i32>::new(1);
        out.borrow_mut().push(ch.try_send(1).is_ok());
        out.borrow_mut().push(ch.try_recv() == Some(1));
    })
    .unwrap();

    fiber::yield_now().unwrap(); // let the target park
    fiber::cancel(&[h], Deadline::PROBE).unwrap();
    assert_eq!(*results.borrow(), [true; 6]);
}

#[test]
fn probe_deadline_skips_grace() {
    let h = fiber::spawn(|| {
        let _ = fiber::sleep(Deadline::NEVER);
    })
    .unwrap();
    fiber::yield_now().unwrap();

    let t0 = Instant::now();
    fiber::cancel(&[h], Deadline::PROBE).unwrap();
    assert!(t0.elapsed() < Duration::from_millis(500));
}

#[test]
fn cancel_many_targets() {
    let done = Rc::new(Cell::new(0u32));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let done = done.clone();
        handles.push(
            fiber::spawn(move || {
                let _ = fiber::sleep(Deadline::NEVER);
                done.set(done.get() + 1);
            })
            .unwrap(),
        );
    }
    fiber::yield_now().unwrap();

    fiber::cancel(&handles, Deadline::after_ms(20)).unwrap();
    assert_eq!(done.get(), 8);
}
