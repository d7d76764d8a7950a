//! Thread stack mapping.
//!
//! Each spawned context gets one fixed-size anonymous mapping with a
//! `PROT_NONE` guard page at the bottom (stacks grow down from the
//! top). The region is owned exclusively by the context until the
//! reclaim protocol in `thread` decides which party unmaps it.
//!
//! The module keeps process-wide map/unmap counters so a driver or
//! test can verify that every stack is freed exactly once: after all
//! handles are joined or detached and their contexts have exited,
//! `stacks_unmapped()` must equal `stacks_mapped()`.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::syscall;

/// Usable stack bytes per thread.
///
/// The trampoline runs Rust code, including the panic-capture unwind
/// path, so this is sized well above the bare minimum a leaf C
/// function would need.
pub const STACK_SIZE: usize = 128 * 1024;

/// Guard page at the bottom of every stack mapping.
pub const GUARD_SIZE: usize = 4096;

const PROT_NONE: i32 = 0x0;
const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = 0x20;

static STACKS_MAPPED: AtomicUsize = AtomicUsize::new(0);
static STACKS_UNMAPPED: AtomicUsize = AtomicUsize::new(0);

/// Total stacks successfully mapped by this process.
pub fn stacks_mapped() -> usize {
    STACKS_MAPPED.load(Ordering::Relaxed)
}

/// Total stacks released by this process.
pub fn stacks_unmapped() -> usize {
    STACKS_UNMAPPED.load(Ordering::Relaxed)
}

/// One thread stack: guard page plus usable region, as mapped.
///
/// `Copy` on purpose — the descriptor travels into the control block
/// and, on the self-free path, into registers; the single-unmap
/// guarantee comes from the `joined` claim in `thread`, not from move
/// semantics here.
#[derive(Debug, Clone, Copy)]
pub struct ThreadStack {
    base: usize,
    total_len: usize,
}

impl ThreadStack {
    /// Map a fresh zero-filled stack region and arm the guard page.
    ///
    /// On any failure the partial mapping is released and the errno is
    /// returned.
    #[allow(unsafe_code)]
    pub fn map() -> Result<Self, i32> {
        let total_len = GUARD_SIZE + STACK_SIZE;

        // SAFETY: anonymous mapping, no fd involved.
        let base = unsafe {
            syscall::sys_mmap(
                core::ptr::null_mut(),
                total_len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        }?;

        // SAFETY: base is the page-aligned region just mapped; the
        // guard page is its lowest page.
        if let Err(errno) = unsafe { syscall::sys_mprotect(base, GUARD_SIZE, PROT_NONE) } {
            // SAFETY: releasing the exact region mapped above.
            let _ = unsafe { syscall::sys_munmap(base, total_len) };
            return Err(errno);
        }

        STACKS_MAPPED.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            base: base as usize,
            total_len,
        })
    }

    /// Lowest address of the mapping (the guard page).
    pub fn base(&self) -> usize {
        self.base
    }

    /// Total mapped bytes, guard included.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// One past the highest mapped byte; initial stack pointers are
    /// derived downward from here.
    pub fn top(&self) -> usize {
        self.base + self.total_len
    }

    /// Release the mapping.
    ///
    /// # Safety
    ///
    /// The caller must hold the reclaim claim for this stack and the
    /// owning context must have exited (or never started).
    #[allow(unsafe_code)]
    pub unsafe fn unmap(self) -> Result<(), i32> {
        STACKS_UNMAPPED.fetch_add(1, Ordering::Relaxed);
        // SAFETY: exact region from map(); exclusivity per the
        // caller's claim.
        unsafe { syscall::sys_munmap(self.base as *mut u8, self.total_len) }
    }

    /// Release the mapping the calling context is running on, then
    /// exit the thread.
    ///
    /// # Safety
    ///
    /// The caller must hold the reclaim claim, must be the context
    /// executing on this stack, and must need nothing from it again —
    /// this never returns and runs no destructors.
    #[allow(unsafe_code)]
    pub unsafe fn unmap_self_and_exit(self) -> ! {
        // Account first: no further instruction on this path may touch
        // the stack once the munmap fires.
        STACKS_UNMAPPED.fetch_add(1, Ordering::Relaxed);
        // SAFETY: forwarded contract; register-only tail.
        unsafe { syscall::sys_unmap_stack_and_exit(self.base, self.total_len) }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_roundtrip() {
        let stack = ThreadStack::map().expect("stack mapping should succeed");
        assert_eq!(stack.total_len(), GUARD_SIZE + STACK_SIZE);
        assert_eq!(stack.top(), stack.base() + stack.total_len());
        assert_eq!(stack.base() % 4096, 0, "mapping should be page-aligned");
        assert_eq!(stack.top() % 16, 0, "stack top should be 16-aligned");

        // SAFETY: no context ever ran on this stack.
        unsafe { stack.unmap() }.expect("unmap should succeed");
    }

    #[test]
    fn usable_region_is_writable_and_zeroed() {
        let stack = ThreadStack::map().expect("stack mapping should succeed");
        let lowest_usable = (stack.base() + GUARD_SIZE) as *mut u8;
        let highest = (stack.top() - 1) as *mut u8;
        // SAFETY: both addresses are inside the usable (non-guard)
        // part of the fresh mapping.
        unsafe {
            assert_eq!(*lowest_usable, 0);
            assert_eq!(*highest, 0);
            *highest = 0x5A;
            assert_eq!(*highest, 0x5A);
        }
        // SAFETY: no context ever ran on this stack.
        unsafe { stack.unmap() }.expect("unmap should succeed");
    }

    #[test]
    fn counters_track_map_and_unmap() {
        // Other tests in this binary map stacks concurrently, so only
        // delta lower bounds are meaningful here.
        let mapped_before = stacks_mapped();
        let unmapped_before = stacks_unmapped();

        let stacks: Vec<ThreadStack> = (0..3)
            .map(|_| ThreadStack::map().expect("stack mapping should succeed"))
            .collect();
        assert!(stacks_mapped() >= mapped_before + 3);

        for stack in stacks {
            // SAFETY: no context ever ran on these stacks.
            unsafe { stack.unmap() }.expect("unmap should succeed");
        }
        assert!(stacks_unmapped() >= unmapped_before + 3);
    }
}
