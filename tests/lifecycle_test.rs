/*!
 * Lifecycle Tests
 * Handler restoration, idempotent stop, and full restart behavior
 */

use nix::libc;
use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Hits recorded by the hand-installed handler standing in for "whatever
/// was trapped before sigdefer took over".
static PREVIOUS_HITS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn count_previous(_signo: libc::c_int) {
    PREVIOUS_HITS.fetch_add(1, Ordering::SeqCst);
}

/// Install the counting handler for SIGUSR1, returning what it replaced.
fn install_counting_handler() -> SigAction {
    let action = SigAction::new(
        SigHandler::Handler(count_previous),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGUSR1, &action) }.unwrap()
}

fn restore_handler(previous: &SigAction) {
    unsafe { sigaction(Signal::SIGUSR1, previous) }.unwrap();
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    sigdefer::stop();
    PREVIOUS_HITS.store(0, Ordering::SeqCst);
}

#[test]
#[serial]
fn stop_reinstalls_previous_handler() {
    init();
    let original = install_counting_handler();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    sigdefer::trap(["USR1"], move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    // While trapped, the shim intercepts and the old handler stays silent.
    raise(Signal::SIGUSR1).unwrap();
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
    assert_eq!(PREVIOUS_HITS.load(Ordering::SeqCst), 0);

    sigdefer::stop();

    // The counting handler is back in effect; raise() runs it synchronously.
    raise(Signal::SIGUSR1).unwrap();
    assert_eq!(PREVIOUS_HITS.load(Ordering::SeqCst), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    restore_handler(&original);
}

#[test]
#[serial]
fn fresh_trap_recaptures_handler_installed_after_stop() {
    init();

    // First lifecycle captures and restores the original disposition.
    sigdefer::trap(["USR1"], || {}).unwrap();
    sigdefer::stop();

    // Another party installs its own handler afterwards.
    let original = install_counting_handler();

    // A fresh trap must capture the counting handler, not the disposition
    // recorded in the first lifecycle.
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    sigdefer::trap(["USR1"], move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    raise(Signal::SIGUSR1).unwrap();
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));
    assert_eq!(PREVIOUS_HITS.load(Ordering::SeqCst), 0);

    sigdefer::stop();

    raise(Signal::SIGUSR1).unwrap();
    assert_eq!(PREVIOUS_HITS.load(Ordering::SeqCst), 1);

    restore_handler(&original);
}

#[test]
#[serial]
fn stop_is_idempotent() {
    init();
    // Nothing trapped: both calls are silent no-ops.
    sigdefer::stop();
    sigdefer::stop();

    sigdefer::trap(["USR1"], || {}).unwrap();
    sigdefer::stop();
    sigdefer::stop();
}

#[test]
#[serial]
fn retrap_from_inside_a_callback_gets_a_working_fresh_worker() {
    init();
    let rearmed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let hits = Arc::new(AtomicUsize::new(0));

    let rearmed_flag = rearmed.clone();
    let fresh_hits = hits.clone();
    sigdefer::trap(["USR1"], move || {
        // Tear down and immediately re-register from the worker's own
        // callback, then linger so the retiring worker is still around
        // while the fresh lifecycle handles deliveries.
        sigdefer::stop();
        let fresh_hits = fresh_hits.clone();
        sigdefer::trap(["USR1"], move || {
            fresh_hits.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        rearmed_flag.store(true, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(300));
    })
    .unwrap();

    raise(Signal::SIGUSR1).unwrap();
    assert!(wait_for(|| rearmed.load(Ordering::SeqCst)));

    // The fresh worker, not the retiring one, must own this delivery.
    raise(Signal::SIGUSR1).unwrap();
    assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1));

    sigdefer::stop();
}

#[test]
#[serial]
fn restart_after_stop_dispatches_with_fresh_worker() {
    init();

    let first_hits = Arc::new(AtomicUsize::new(0));
    let counter = first_hits.clone();
    sigdefer::trap(["USR1"], move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    raise(Signal::SIGUSR1).unwrap();
    assert!(wait_for(|| first_hits.load(Ordering::SeqCst) == 1));

    sigdefer::stop();

    // Old callbacks are gone; the new lifecycle dispatches only its own.
    let second_hits = Arc::new(AtomicUsize::new(0));
    let counter = second_hits.clone();
    sigdefer::trap(["USR1"], move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    raise(Signal::SIGUSR1).unwrap();
    assert!(wait_for(|| second_hits.load(Ordering::SeqCst) == 1));
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);

    sigdefer::stop();
}
