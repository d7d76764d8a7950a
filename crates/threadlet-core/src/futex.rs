//! Word-level block/wake on top of the futex syscall.
//!
//! The contract callers rely on: [`wait`] sleeps only while the word
//! still holds `expected`, and may return spuriously — loop and
//! re-check the word, never trust the wakeup alone. [`wake`] wakes up
//! to `n` waiters blocked on the same word.

use core::sync::atomic::AtomicU32;

use crate::syscall;

pub const FUTEX_WAIT: i32 = 0;
pub const FUTEX_WAKE: i32 = 1;
pub const FUTEX_PRIVATE_FLAG: i32 = 0x80;

/// Block until `word` no longer holds `expected` (process-private).
///
/// Returns immediately if the word already differs; may also return
/// spuriously or on a signal. The caller's loop re-checks the word.
#[allow(unsafe_code)]
pub fn wait(word: &AtomicU32, expected: u32) {
    let uaddr = word.as_ptr() as *const u32;
    // SAFETY: uaddr comes from a live &AtomicU32, so it is valid and
    // aligned. EAGAIN/EINTR are part of the contract and ignored.
    let _ = unsafe {
        syscall::sys_futex(
            uaddr,
            FUTEX_WAIT | FUTEX_PRIVATE_FLAG,
            expected,
            0,
            0,
            0,
        )
    };
}

/// Wake up to `n` contexts blocked on `word` (process-private).
///
/// Returns how many were actually woken.
#[allow(unsafe_code)]
pub fn wake(word: &AtomicU32, n: u32) -> usize {
    let uaddr = word.as_ptr() as *const u32;
    // SAFETY: uaddr comes from a live &AtomicU32.
    let woken = unsafe {
        syscall::sys_futex(uaddr, FUTEX_WAKE | FUTEX_PRIVATE_FLAG, n, 0, 0, 0)
    };
    woken.unwrap_or(0) as usize
}

/// Block until the word at `uaddr` no longer holds `expected`, using
/// the shared (non-private) form.
///
/// The kernel's own wakes — notably the exit-time `CLONE_CHILD_CLEARTID`
/// wake — are not private, so a waiter on such a word must not use
/// `FUTEX_PRIVATE_FLAG` or it can miss the wake and sleep forever.
///
/// # Safety
///
/// `uaddr` must point to a live, 4-byte-aligned word that stays mapped
/// for the duration of the wait.
#[allow(unsafe_code)]
pub unsafe fn wait_raw(uaddr: *const u32, expected: u32) {
    // SAFETY: forwarded contract.
    let _ = unsafe { syscall::sys_futex(uaddr, FUTEX_WAIT, expected, 0, 0, 0) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_with_no_waiters_returns_zero() {
        let word = AtomicU32::new(0);
        assert_eq!(wake(&word, 1), 0);
        assert_eq!(wake(&word, u32::MAX), 0);
    }

    #[test]
    fn wait_returns_immediately_on_stale_expected() {
        // The word already differs from `expected`, so this must not
        // block; the test hanging here would be the failure mode.
        let word = AtomicU32::new(7);
        wait(&word, 0);
    }

    #[test]
    #[allow(unsafe_code)]
    fn wait_raw_returns_immediately_on_stale_expected() {
        let word = AtomicU32::new(3);
        // SAFETY: the word outlives the wait.
        unsafe { wait_raw(word.as_ptr() as *const u32, 0) };
    }
}
