use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use spindle::clock::Deadline;
use spindle::fiber::{self, YieldResult};
use spindle::Error;

#[test]
fn spawn_does_not_yield() {
    let ran = Rc::new(RefCell::new(false));
    let flag = ran.clone();
    let h = fiber::spawn(move || *flag.borrow_mut() = true).unwrap();

    // The new fiber sits at the tail of the ready queue until we yield.
    assert!(!*ran.borrow());
    fiber::yield_now().unwrap();
    assert!(*ran.borrow());

    fiber::cancel(&[h], Deadline::NEVER).unwrap();
}

#[test]
fn ready_queue_is_fifo() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut handles = Vec::new();
    for name in ["a", "b", "c"] {
        let order = order.clone();
        let h = fiber::Builder::new()
            .name(name)
            .spawn(move || order.borrow_mut().push(name))
            .unwrap();
        handles.push(h);
    }

    fiber::yield_now().unwrap();
    assert_eq!(*order.borrow(), ["a", "b", "c"]);

    fiber::cancel(&handles, Deadline::NEVER).unwrap();
}

#[test]
fn builder_rejects_tiny_stacks() {
    let err = fiber::Builder::new().stack_size(1024).unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
    assert_eq!(err.errno(), libc::EINVAL);
}

#[test]
fn builder_custom_stack() {
    let h = fiber::Builder::new()
        .name("deep")
        .stack_size(fiber::MIN_STACK_SIZE)
        .unwrap()
        .spawn(|| {
            // Burn a little stack to prove the mapping is usable.
            let buf = [0u8; 4096];
            assert_eq!(buf.iter().map(|&b| b as usize).sum::<usize>(), 0);
        })
        .unwrap();
    fiber::cancel(&[h], Deadline::after_ms(1000)).unwrap();
}

#[test]
fn sleep_reaches_deadline() {
    let t0 = Instant::now();
    fiber::sleep(Deadline::after_ms(60)).unwrap();
    assert!(t0.elapsed() >= Duration::from_millis(55));
    assert!(t0.elapsed() < Duration::from_secs(5));
}

#[test]
fn sleep_probe_is_a_reschedule() {
    assert_eq!(
        fiber::check_yield(|| fiber::sleep(Deadline::PROBE).unwrap()),
        YieldResult::Yielded(())
    );
    assert_eq!(fiber::check_yield(|| ()), YieldResult::DidntYield(()));
}

#[test]
fn yields_interleave() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let their_log = log.clone();
    let h = fiber::spawn(move || {
        for i in 0..3 {
            their_log.borrow_mut().push(format!("fiber-{}", i));
            fiber::yield_now().unwrap();
        }
    })
    .unwrap();

    for i in 0..3 {
        log.borrow_mut().push(format!("main-{}", i));
        fiber::yield_now().unwrap();
    }

    assert_eq!(
        *log.borrow(),
        ["main-0", "fiber-0", "main-1", "fiber-1", "main-2", "fiber-2"]
    );
    fiber::cancel(&[h], Deadline::after_ms(1000)).unwrap();
}

#[test]
fn local_slot_is_per_fiber() {
    fiber::set_local(0x5d1e as *mut _);
    let h = fiber::spawn(|| {
        assert!(fiber::local().is_null());
        fiber::set_local(0x1 as *mut _);
    })
    .unwrap();
    fiber::yield_now().unwrap();
    assert_eq!(fiber::local() as usize, 0x5d1e);
    fiber::cancel(&[h], Deadline::NEVER).unwrap();
}

#[test]
#[should_panic(expected = "deadlock")]
fn deadlock_is_detected() {
    // Nothing can ever complete this receive: no sender, no timer, no fd.
    let ch = spindle::channel::Channel::<i32>::new(0);
    let _ = ch.recv();
}
