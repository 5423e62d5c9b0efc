//! Raw futex wait/wake over an `AtomicU32` that lives in shared memory.
//!
//! The words these functions operate on sit inside mmap'd regions attached
//! by several processes, so the `FUTEX_PRIVATE_FLAG` must not be used: a
//! private futex is keyed by virtual address and would never match a waiter
//! in another process.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Outcome of a futex wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Woken, or the word no longer held `expected` (spurious wakes
    /// included; callers re-check their condition in a loop).
    Woken,
    /// The relative timeout expired before a wake arrived.
    TimedOut,
}

#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
    use std::ptr;

    let ts;
    let ts_ptr = match timeout {
        Some(d) => {
            ts = libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => ptr::null(),
    };

    loop {
        let rv = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                libc::FUTEX_WAIT,
                expected,
                ts_ptr,
                ptr::null::<u32>(),
                0u32,
            )
        };
        if rv == 0 {
            return WaitResult::Woken;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            // Value changed before we slept: that is a wake for our purposes.
            Some(libc::EAGAIN) => return WaitResult::Woken,
            Some(libc::ETIMEDOUT) => return WaitResult::TimedOut,
            // Signal delivery interrupts the wait; retry with the same
            // (relative) timeout rather than surfacing EINTR to callers.
            Some(libc::EINTR) => continue,
            _ => return WaitResult::Woken,
        }
    }
}

#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, n: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicU32 as *const u32,
            libc::FUTEX_WAKE,
            n,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

// Non-Linux fallback: yield-based polling. Keeps the crate compiling on
// development machines; the deployed sampler hosts are Linux.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> WaitResult {
    use std::sync::atomic::Ordering;
    use std::time::Instant;
    let start = Instant::now();
    while word.load(Ordering::Acquire) == expected {
        if let Some(t) = timeout {
            if start.elapsed() >= t {
                return WaitResult::TimedOut;
            }
        }
        std::thread::yield_now();
    }
    WaitResult::Woken
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _n: i32) {}
