//! Futex mutex for shared-memory regions.
//!
//! # Protocol
//!
//! The mutex is one `AtomicU32` word:
//!
//! - `0`: unlocked
//! - `1`: locked, no waiters
//! - `2`: locked, at least one waiter sleeping on the futex
//!
//! **Lock:** CAS 0→1 on the fast path. On contention, set the word to 2 and
//! `futex_wait` while it stays 2; on each wake attempt CAS 0→2 (2, not 1:
//! after waiting we cannot know whether other waiters remain, so the next
//! unlock must issue a wake).
//!
//! **Unlock:** swap to 0; if the previous value was 2, wake one waiter.
//!
//! The only user-facing entry point returns a guard, so the word is
//! released on every exit path out of the critical section, panics
//! included. Stages rely on this when a status update unwinds mid-put.

use crate::futex::{futex_wait, futex_wake};
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A mutex whose state is a single word, suitable for placement inside a
/// shared mapping. Attachers obtain `&ShmMutex` by casting a pointer into
/// the region; the word at that offset must have been zeroed (= unlocked)
/// when the region was created.
#[repr(transparent)]
pub struct ShmMutex {
    word: AtomicU32,
}

impl ShmMutex {
    /// Reset to unlocked. Only valid while no other process can be inside
    /// the critical section, i.e. during region initialisation or external
    /// cleanup.
    pub fn init(&self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }

    pub fn lock(&self) -> ShmMutexGuard<'_> {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        ShmMutexGuard { mutex: self }
    }

    fn lock_contended(&self) {
        loop {
            // Advertise a waiter, then sleep while the lock stays held.
            if self.word.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            futex_wait(&self.word, CONTENDED, None);
        }
    }

    fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.word, 1);
        }
    }
}

/// RAII guard. Dropping it releases the mutex, so cancellation or panic
/// between `lock()` and the end of scope cannot leave the word held.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    fn fresh() -> Arc<ShmMutex> {
        let m = Arc::new(ShmMutex {
            word: AtomicU32::new(0),
        });
        m.init();
        m
    }

    #[test]
    fn guard_releases_on_drop() {
        let m = fresh();
        {
            let _g = m.lock();
            assert_ne!(m.word.load(Ordering::Relaxed), UNLOCKED);
        }
        assert_eq!(m.word.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn guard_releases_on_panic() {
        let m = fresh();
        let m2 = Arc::clone(&m);
        let _ = std::thread::spawn(move || {
            let _g = m2.lock();
            panic!("poisoned on purpose");
        })
        .join();
        // The unwind ran the guard's Drop, so we can lock again.
        let _g = m.lock();
    }

    #[test]
    fn mutual_exclusion_under_contention() {
        let m = fresh();
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let _g = m.lock();
                    // Non-atomic read-modify-write under the lock.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 40_000);
    }
}
