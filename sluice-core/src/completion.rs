//! Cross-thread completion signal for synchronous requests
//!
//! The reactor thread marks a request done; the caller either spins on the
//! flag or parks on a condition variable, depending on [`WaitStrategy`].
//! A caller that gives up can abandon the wait, which hands the cleanup of
//! the request over to the reactor.

use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::options::WaitStrategy;

const WAITING: u8 = 0;
const DONE: u8 = 1;
const ABANDONED: u8 = 2;

/// One-shot completion flag shared between a caller and the reactor.
#[derive(Debug, Default)]
pub struct Completion {
    state: AtomicU8,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm for a new request.
    pub fn arm(&self) {
        self.state.store(WAITING, Ordering::Release);
    }

    /// Whether the reactor has completed the request.
    #[inline]
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Mark the request done and wake a parked waiter.
    ///
    /// Returns `false` if the waiter had already abandoned the request, in
    /// which case nobody will pick the result up.
    pub fn complete(&self) -> bool {
        let prev = self.state.swap(DONE, Ordering::AcqRel);
        {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
        prev != ABANDONED
    }

    /// Block until [`Completion::complete`] is called.
    pub fn wait(&self, strategy: WaitStrategy) {
        match strategy {
            WaitStrategy::Spin => {
                while !self.is_done() {
                    thread::yield_now();
                }
            }
            WaitStrategy::Park => {
                let mut guard = self.lock.lock();
                while !self.is_done() {
                    self.cond.wait(&mut guard);
                }
            }
        }
    }

    /// Block until completion or `deadline`.
    ///
    /// Returns `true` when the request completed. On timeout the wait is
    /// abandoned and `false` is returned; the caller must not touch the
    /// request afterwards.
    pub fn wait_until(&self, strategy: WaitStrategy, deadline: Instant) -> bool {
        match strategy {
            WaitStrategy::Spin => {
                while !self.is_done() {
                    if Instant::now() >= deadline {
                        return self.abandon();
                    }
                    thread::yield_now();
                }
            }
            WaitStrategy::Park => {
                let mut guard = self.lock.lock();
                while !self.is_done() {
                    if self.cond.wait_until(&mut guard, deadline).timed_out() {
                        drop(guard);
                        return self.abandon();
                    }
                }
            }
        }
        true
    }

    /// Returns `true` if completion won the race against abandonment.
    pub(crate) fn abandon(&self) -> bool {
        self.state
            .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_spin_wait() {
        let c = Arc::new(Completion::new());
        let signal = Arc::clone(&c);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            assert!(signal.complete());
        });
        c.wait(WaitStrategy::Spin);
        assert!(c.is_done());
        t.join().unwrap();
    }

    #[test]
    fn test_park_wait() {
        let c = Arc::new(Completion::new());
        let signal = Arc::clone(&c);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signal.complete();
        });
        c.wait(WaitStrategy::Park);
        assert!(c.is_done());
        t.join().unwrap();
    }

    #[test]
    fn test_timeout_abandons() {
        for strategy in [WaitStrategy::Spin, WaitStrategy::Park] {
            let c = Completion::new();
            let deadline = Instant::now() + Duration::from_millis(5);
            assert!(!c.wait_until(strategy, deadline));
            assert!(!c.complete(), "late completion sees the abandonment");
        }
    }

    #[test]
    fn test_rearm() {
        let c = Completion::new();
        c.complete();
        c.arm();
        assert!(!c.is_done());
        assert!(!c.wait_until(WaitStrategy::Spin, Instant::now()));
    }
}
