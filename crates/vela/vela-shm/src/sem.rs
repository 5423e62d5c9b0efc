//! Futex counting semaphore for shared-memory regions.
//!
//! One `AtomicU32` word holds the count. `post` increments and wakes one
//! waiter; `wait` decrements, sleeping on the futex while the count is
//! zero. The databuf uses one pair of these per block ("free"/"filled"),
//! so a post on one side is exactly one granted ownership on the other.
//!
//! The Release store in `post` paired with the Acquire CAS in `wait` is
//! what gives the pipeline its ordering guarantee: everything the producer
//! wrote into a block happens-before the consumer that acquires it.

use crate::futex::{WaitResult, futex_wait, futex_wake};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Counting semaphore as a single in-region word. Obtain `&ShmSemaphore`
/// by casting a pointer to a zero-initialised (count 0) offset in a shared
/// mapping.
#[repr(transparent)]
pub struct ShmSemaphore {
    count: AtomicU32,
}

impl ShmSemaphore {
    /// Set the count outright. Region initialisation / clear only; not
    /// safe concurrent with waiters.
    pub fn init(&self, value: u32) {
        self.count.store(value, Ordering::Release);
    }

    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
        futex_wake(&self.count, 1);
    }

    /// Decrement, blocking until the count is nonzero.
    pub fn wait(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            futex_wait(&self.count, 0, None);
        }
    }

    /// Decrement with a bound. Returns false if the timeout elapsed with
    /// the count still zero. Stage loops use short timeouts here so they
    /// can poll the run flag out of otherwise unbounded ring waits.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_acquire() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if futex_wait(&self.count, 0, Some(remaining)) == WaitResult::TimedOut {
                // One more try: a post may have raced the timeout.
                return self.try_acquire();
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        while cur > 0 {
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fresh(value: u32) -> Arc<ShmSemaphore> {
        let s = Arc::new(ShmSemaphore {
            count: AtomicU32::new(0),
        });
        s.init(value);
        s
    }

    #[test]
    fn post_then_wait_does_not_block() {
        let s = fresh(0);
        s.post();
        s.wait();
        assert_eq!(s.value(), 0);
    }

    #[test]
    fn wait_timeout_expires_on_zero_count() {
        let s = fresh(0);
        let start = Instant::now();
        assert!(!s.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn wait_blocks_until_peer_posts() {
        let s = fresh(0);
        let s2 = Arc::clone(&s);
        let waiter = std::thread::spawn(move || s2.wait());
        std::thread::sleep(Duration::from_millis(20));
        s.post();
        waiter.join().unwrap();
        assert_eq!(s.value(), 0);
    }

    #[test]
    fn counts_are_conserved_across_threads() {
        let s = fresh(0);
        const N: usize = 1_000;
        let poster = {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                for _ in 0..N {
                    s.post();
                }
            })
        };
        let s2 = Arc::clone(&s);
        let waiter = std::thread::spawn(move || {
            for _ in 0..N {
                s2.wait();
            }
        });
        poster.join().unwrap();
        waiter.join().unwrap();
        assert_eq!(s.value(), 0);
    }
}
