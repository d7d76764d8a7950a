//! Typed veneer over the raw x86_64 Linux syscalls the thread core
//! needs: anonymous memory mapping, futex, clone, and yield.
//!
//! Raw returns are decoded by [`syscall_result`]: values in
//! `[-4095, -1]` (as unsigned) are `-errno`, everything else is
//! success. The wrappers encode argument types but cannot verify
//! pointer validity; that stays with the caller.

#[allow(unsafe_code)]
mod raw;

pub use raw::*;

// -------------------------------------------------------------------------
// Syscall numbers (x86_64 Linux)
// -------------------------------------------------------------------------

pub const SYS_MMAP: usize = 9;
pub const SYS_MPROTECT: usize = 10;
pub const SYS_MUNMAP: usize = 11;
pub const SYS_SCHED_YIELD: usize = 24;
pub const SYS_FUTEX: usize = 202;
pub const SYS_SET_TID_ADDRESS: usize = 218;

// -------------------------------------------------------------------------
// Errno decoding
// -------------------------------------------------------------------------

/// Largest errno value the kernel encodes in a return register.
const MAX_ERRNO: usize = 4095;

/// Decode a raw syscall return into `Result<usize, i32>`.
#[inline]
pub fn syscall_result(ret: usize) -> Result<usize, i32> {
    if ret > usize::MAX - MAX_ERRNO {
        Err(-(ret as isize) as i32)
    } else {
        Ok(ret)
    }
}

// -------------------------------------------------------------------------
// Typed wrappers
// -------------------------------------------------------------------------

/// `mmap(addr, length, prot, flags, fd, offset)` — map memory.
///
/// # Safety
///
/// The caller must ensure the mapping parameters are valid and use the
/// resulting region according to the requested protection.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_mmap(
    addr: *mut u8,
    length: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: i64,
) -> Result<*mut u8, i32> {
    // SAFETY: caller is responsible for mapping validity.
    let ret = unsafe {
        raw::syscall6(
            SYS_MMAP,
            addr as usize,
            length,
            prot as usize,
            flags as usize,
            fd as usize,
            offset as usize,
        )
    };
    syscall_result(ret).map(|v| v as *mut u8)
}

/// `munmap(addr, length)` — unmap memory.
///
/// # Safety
///
/// `addr` must be page-aligned and `[addr, addr+length)` must be a
/// mapped region no other context is still executing on.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_munmap(addr: *mut u8, length: usize) -> Result<(), i32> {
    // SAFETY: caller guarantees addr/length validity.
    let ret = unsafe { raw::syscall2(SYS_MUNMAP, addr as usize, length) };
    syscall_result(ret).map(|_| ())
}

/// `mprotect(addr, length, prot)` — change protection on a mapping.
///
/// # Safety
///
/// `addr` must be page-aligned and the range must be mapped.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_mprotect(addr: *mut u8, length: usize, prot: i32) -> Result<(), i32> {
    // SAFETY: caller guarantees addr/length validity.
    let ret = unsafe { raw::syscall3(SYS_MPROTECT, addr as usize, length, prot as usize) };
    syscall_result(ret).map(|_| ())
}

/// `futex(uaddr, futex_op, val, timeout, uaddr2, val3)`.
///
/// # Safety
///
/// `uaddr` must point to a live, 4-byte-aligned `u32`; the remaining
/// arguments must match the chosen futex operation.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_futex(
    uaddr: *const u32,
    futex_op: i32,
    val: u32,
    timeout: usize,
    uaddr2: usize,
    val3: u32,
) -> Result<isize, i32> {
    // SAFETY: caller guarantees uaddr validity and op invariants.
    let ret = unsafe {
        raw::syscall6(
            SYS_FUTEX,
            uaddr as usize,
            futex_op as usize,
            val as usize,
            timeout,
            uaddr2,
            val3 as usize,
        )
    };
    syscall_result(ret).map(|v| v as isize)
}

/// `sched_yield()` — relinquish the processor.
#[inline]
#[allow(unsafe_code)]
pub fn sys_sched_yield() {
    // SAFETY: sched_yield has no preconditions and cannot fail in a
    // way the caller can act on.
    let _ = unsafe { raw::syscall0(SYS_SCHED_YIELD) };
}

/// `set_tid_address(tidptr)` — replace the calling thread's
/// clear-on-exit tid registration; null disarms it. Returns the
/// caller's TID.
///
/// A thread about to unmap its own stack must disarm the registration
/// first: the kernel performs the clear-tid write at thread death, and
/// an address inside a released mapping may by then belong to a new
/// mapping at the same spot.
///
/// # Safety
///
/// A non-null `tidptr` must stay valid until thread exit or the next
/// registration.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_set_tid_address(tidptr: *mut i32) -> i32 {
    // SAFETY: the kernel only stores the pointer; validity over the
    // registration window is the caller's contract above.
    let ret = unsafe { raw::syscall1(SYS_SET_TID_ADDRESS, tidptr as usize) };
    ret as i32
}

/// Start a new thread via `clone`.
///
/// The child begins in [`raw::clone_start_asm`]'s start path: it pops
/// an entry function pointer and an argument word from `child_sp`,
/// calls the function, and exits the thread with its return value.
///
/// # Safety
///
/// - `child_sp` must point to a prepared two-word start frame inside a
///   live stack region (see [`raw::clone_start_asm`]).
/// - `parent_tid` / `child_tid` must be valid if the corresponding
///   `CLONE_PARENT_SETTID` / `CLONE_CHILD_CLEARTID` flags are set.
/// - The entry function in the frame must be a callable
///   `unsafe extern "C" fn(usize) -> usize`.
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_clone_thread(
    flags: usize,
    child_sp: usize,
    parent_tid: *mut i32,
    child_tid: *mut i32,
    tls: usize,
) -> Result<i32, i32> {
    // SAFETY: forwarded contract; the asm separates parent and child
    // return paths.
    let ret = unsafe {
        raw::clone_start_asm(
            flags,
            child_sp,
            parent_tid as usize,
            child_tid as usize,
            tls,
        )
    };
    let signed = ret as isize;
    if signed < 0 {
        Err((-signed) as i32)
    } else {
        Ok(signed as i32)
    }
}

/// Unmap the calling context's own stack and exit the thread.
///
/// # Safety
///
/// `base`/`len` must be the exact mmap'd stack region the caller runs
/// on, no other party may hold the reclaim claim for it, and nothing
/// on that stack may be used afterwards (this never returns and runs
/// no destructors).
#[inline]
#[allow(unsafe_code)]
pub unsafe fn sys_unmap_stack_and_exit(base: usize, len: usize) -> ! {
    // SAFETY: forwarded contract; the asm tail touches no memory after
    // the munmap.
    unsafe { raw::unmap_self_exit_asm(base, len) }
}

// -------------------------------------------------------------------------
// Unit tests
// -------------------------------------------------------------------------
