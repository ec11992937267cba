#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in the bytes pool packages.

use std::sync::{Barrier, mpsc};
use std::thread;
use std::time::Duration;

/// Runs a test with a timeout so a livelocked or deadlocked test fails instead of hanging.
///
/// The timeout is 10 seconds, or 60 seconds under Miri. Setting the `MUTATION_TESTING`
/// environment variable to "1" disables the watchdog so that mutation testing can detect
/// hanging mutations itself.
///
/// # Panics
///
/// Panics if the test exceeds the timeout. Re-raises any panic from the test itself.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // The receiver is gone if we already timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded {}-second timeout", timeout.as_secs());
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Runs `f` on `thread_count` threads that all start at the same moment, maximizing contention
/// on whatever `f` touches. Returns the results in thread order.
///
/// Each invocation receives the index of its thread.
///
/// # Panics
///
/// Re-raises the first panic from any of the threads.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use testing::run_contended;
///
/// let counter = AtomicUsize::new(0);
///
/// let results = run_contended(4, |index| {
///     counter.fetch_add(1, Ordering::Relaxed);
///     index * 10
/// });
///
/// assert_eq!(results, [0, 10, 20, 30]);
/// assert_eq!(counter.load(Ordering::Relaxed), 4);
/// ```
pub fn run_contended<F, R>(thread_count: usize, f: F) -> Vec<R>
where
    F: Fn(usize) -> R + Sync,
    R: Send,
{
    let barrier = Barrier::new(thread_count);

    thread::scope(|scope| {
        let handles = (0..thread_count)
            .map(|index| {
                let barrier = &barrier;
                let f = &f;

                scope.spawn(move || {
                    barrier.wait();
                    f(index)
                })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(e) => std::panic::resume_unwind(e),
            })
            .collect()
    })
}
