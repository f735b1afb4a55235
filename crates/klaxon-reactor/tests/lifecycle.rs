//! Integration tests for loop lifecycle: starting, stopping, waking a
//! blocked wait from another thread, and surviving misbehaving callbacks.

use std::cell::Cell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use klaxon_reactor::{Reactor, ReactorError};

/// Test that a waker stops a loop that is blocked with nothing to do.
#[test]
fn test_waker_exits_blocked_loop_from_another_thread() {
    let reactor = Reactor::new().unwrap();
    let waker = reactor.waker();

    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        waker.exit().unwrap();
    });

    let started = Instant::now();
    // No timers registered: without the waker this would block forever.
    reactor.start().unwrap();
    let elapsed = started.elapsed();
    t.join().unwrap();

    assert!(elapsed >= Duration::from_millis(50));
    assert!(
        elapsed < Duration::from_secs(10),
        "waker did not unblock the wait: {elapsed:?}"
    );
}

/// Test that wake alone nudges the loop without stopping it.
#[test]
fn test_wake_does_not_stop_the_loop() {
    let reactor = Reactor::new().unwrap();
    let waker = reactor.waker();

    let r = reactor.clone();
    reactor
        .add_timer(Duration::from_millis(100), false, move |_| r.stop())
        .unwrap();

    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        waker.wake().unwrap();
    });

    let started = Instant::now();
    reactor.start().unwrap();
    t.join().unwrap();

    // The loop must have survived the wake and run until the stop timer.
    assert!(started.elapsed() >= Duration::from_millis(100));
}

/// Test that stop freezes armed countdowns and a later start resumes them
/// without re-arming or firing immediately.
#[test]
fn test_restart_resumes_frozen_countdowns() {
    let reactor = Reactor::new().unwrap();
    let fired = Rc::new(Cell::new(false));

    let f = Rc::clone(&fired);
    let r = reactor.clone();
    reactor
        .add_timer(Duration::from_millis(200), false, move |_| {
            f.set(true);
            r.stop();
        })
        .unwrap();
    let r = reactor.clone();
    reactor
        .add_timer(Duration::from_millis(50), false, move |_| r.stop())
        .unwrap();

    reactor.start().unwrap();
    assert!(!fired.get(), "long countdown fired during the short run");

    // Roughly 150ms should remain on the long countdown.
    let started = Instant::now();
    reactor.start().unwrap();
    let second_run = started.elapsed();

    assert!(fired.get());
    assert!(
        second_run >= Duration::from_millis(60),
        "countdown fired early after resume: {second_run:?}"
    );
    assert!(
        second_run < Duration::from_millis(195),
        "countdown was re-armed instead of resumed: {second_run:?}"
    );
}

/// Test that a cross-thread exit charges armed countdowns for the time the
/// loop spent blocked, so a later start resumes them where they stood.
#[test]
fn test_waker_exit_keeps_blocked_time_counted_down() {
    let reactor = Reactor::new().unwrap();
    let waker = reactor.waker();
    let fired = Rc::new(Cell::new(false));

    let f = Rc::clone(&fired);
    let r = reactor.clone();
    reactor
        .add_timer(Duration::from_millis(300), false, move |_| {
            f.set(true);
            r.stop();
        })
        .unwrap();

    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        waker.exit().unwrap();
    });
    reactor.start().unwrap();
    t.join().unwrap();
    assert!(!fired.get(), "countdown fired during the interrupted run");

    // Roughly 150ms should remain; a full 300ms means the blocked wait
    // was never charged to the countdown.
    let started = Instant::now();
    reactor.start().unwrap();
    let second_run = started.elapsed();

    assert!(fired.get());
    assert!(
        second_run >= Duration::from_millis(60),
        "countdown fired early after resume: {second_run:?}"
    );
    assert!(
        second_run < Duration::from_millis(240),
        "blocked time was dropped from the countdown: {second_run:?}"
    );
}

/// Test that a panicking callback is contained and the loop keeps serving
/// other registrations.
#[test]
fn test_callback_panic_does_not_kill_loop() {
    let reactor = Reactor::new().unwrap();
    let survived = Rc::new(Cell::new(false));

    reactor
        .add_timer(Duration::from_millis(10), false, |_| {
            panic!("deliberate test panic");
        })
        .unwrap();

    let s = Rc::clone(&survived);
    let r = reactor.clone();
    reactor
        .add_timer(Duration::from_millis(60), false, move |_| {
            s.set(true);
            r.stop();
        })
        .unwrap();

    reactor.start().unwrap();
    assert!(survived.get(), "loop died with the panicking callback");
}

/// Test that starting an already-running loop fails instead of recursing.
#[test]
fn test_start_while_running_is_refused() {
    let reactor = Reactor::new().unwrap();
    let verdict = Rc::new(Cell::new(None));

    let r = reactor.clone();
    let v = Rc::clone(&verdict);
    reactor
        .add_timer(Duration::from_millis(10), false, move |_| {
            v.set(Some(matches!(r.start(), Err(ReactorError::Fatal { .. }))));
            r.stop();
        })
        .unwrap();

    reactor.start().unwrap();
    assert_eq!(verdict.get(), Some(true), "nested start did not fail fatally");
}

/// Test that exit_now from a callback stops without waiting out pending
/// countdowns, and that the instance stays usable afterwards.
#[test]
fn test_exit_now_preempts_pending_countdowns() {
    let reactor = Reactor::new().unwrap();

    // Would keep an orderly stop's final wait alive for 10 seconds.
    reactor
        .add_timer(Duration::from_secs(10), false, |_| {})
        .unwrap();
    let r = reactor.clone();
    reactor
        .add_timer(Duration::from_millis(20), false, move |_| r.exit_now())
        .unwrap();

    let started = Instant::now();
    reactor.start().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    // The shutdown token must not leak into the next run.
    let r = reactor.clone();
    reactor
        .add_timer(Duration::from_millis(30), false, move |_| r.stop())
        .unwrap();
    let started = Instant::now();
    reactor.start().unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(30),
        "second run ended before its stop timer"
    );
}
