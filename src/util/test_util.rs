//! Helpers for tests that exercise the collector with real threads.

use std::panic;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

lazy_static! {
    // A global lock to force some tests to run one at a time. Tests that
    // touch process-wide state (environment variables, the logger) need it.
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

/// Run `f` while holding the global serial-test lock.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // A test failure poisons the lock; keep running the remaining tests.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

/// Run a cleanup closure whether or not the test body panics.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}

/// Run `f` on a fresh thread and panic if it has not finished after
/// `millis`. Blocking-wait tests use this as a watchdog so a missed wakeup
/// fails the test instead of hanging the suite.
pub fn panic_after<T, F>(millis: u64, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let val = f();
        done_tx.send(()).expect("unable to send completion signal");
        val
    });

    match done_rx.recv_timeout(Duration::from_millis(millis)) {
        Ok(_) => handle.join().expect("test thread panicked"),
        Err(e) => panic!("test thread took too long: {}", e),
    }
}
