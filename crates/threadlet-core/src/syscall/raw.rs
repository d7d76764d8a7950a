//! Raw x86_64 Linux syscall primitives.
//!
//! One `syscall` instruction per function; the raw kernel return value
//! comes back in `rax` untranslated. Register assignment follows the
//! x86_64 syscall ABI:
//!
//! ```text
//! number → rax, args → rdi rsi rdx r10 r8 r9
//! return → rax, clobbered → rcx r11
//! ```
//!
//! Besides the generic `syscallN` family this module carries two
//! special-purpose routines for thread lifecycle: [`clone_start_asm`]
//! (clone with an in-asm child start path) and [`unmap_self_exit_asm`]
//! (a register-only munmap+exit tail for a context freeing the stack
//! it is currently running on).

use core::arch::asm;

/// Issue a syscall with no arguments.
///
/// # Safety
///
/// `nr` must be a valid syscall number; the caller owns the return
/// value semantics.
#[inline]
pub unsafe fn syscall0(nr: usize) -> usize {
    let ret: usize;
    // SAFETY: single syscall instruction; caller vouches for nr.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// Issue a syscall with 1 argument.
///
/// # Safety
///
/// `nr` and `a1` must form a valid kernel request.
#[inline]
pub unsafe fn syscall1(nr: usize, a1: usize) -> usize {
    let ret: usize;
    // SAFETY: single syscall instruction; caller vouches for arguments.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// Issue a syscall with 2 arguments.
///
/// # Safety
///
/// The arguments must form a valid kernel request.
#[inline]
pub unsafe fn syscall2(nr: usize, a1: usize, a2: usize) -> usize {
    let ret: usize;
    // SAFETY: single syscall instruction; caller vouches for arguments.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// Issue a syscall with 3 arguments.
///
/// # Safety
///
/// The arguments must form a valid kernel request.
#[inline]
pub unsafe fn syscall3(nr: usize, a1: usize, a2: usize, a3: usize) -> usize {
    let ret: usize;
    // SAFETY: single syscall instruction; caller vouches for arguments.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// Issue a syscall with 6 arguments.
///
/// # Safety
///
/// The arguments must form a valid kernel request.
#[inline]
pub unsafe fn syscall6(
    nr: usize,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> usize {
    let ret: usize;
    // SAFETY: single syscall instruction; caller vouches for arguments.
    unsafe {
        asm!(
            "syscall",
            inlateout("rax") nr => ret,
            in("rdi") a1,
            in("rsi") a2,
            in("rdx") a3,
            in("r10") a4,
            in("r8") a5,
            in("r9") a6,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack, preserves_flags),
        );
    }
    ret
}

/// `clone` with an in-asm child start path.
///
/// The child stack at `child_sp` must hold a two-word frame:
///
/// ```text
/// [child_sp + 0]  entry function pointer (extern "C" fn(usize) -> usize)
/// [child_sp + 8]  argument word
/// ```
///
/// The parent returns normally with the child TID (or `-errno`) in the
/// return value. The child resumes at the instruction after `syscall`
/// with `rax == 0`, pops the frame, aligns `rsp` to 16, and calls the
/// entry function; if the entry function returns, its return value
/// becomes the `exit` status of the thread (not the process).
///
/// # Safety
///
/// - `child_sp` must point into a live, writable stack region prepared
///   with the frame above, and the region must stay mapped until the
///   reclaim protocol says the child is done with it.
/// - `parent_tid` / `child_tid` must be valid for the corresponding
///   `CLONE_PARENT_SETTID` / `CLONE_CHILD_CLEARTID` flags.
#[inline]
pub unsafe fn clone_start_asm(
    flags: usize,
    child_sp: usize,
    parent_tid: usize,
    child_tid: usize,
    tls: usize,
) -> usize {
    let ret: usize;
    // SAFETY: the caller prepared child_sp per the frame contract. The
    // child path below touches only its own freshly-cloned stack and
    // registers; the parent path falls straight through to label 2.
    unsafe {
        asm!(
            // clone's 4th and 5th arguments go in r10/r8.
            "mov r10, {ctid}",
            "mov r8, {tls}",
            "mov eax, 56",        // SYS_clone
            "syscall",
            "test rax, rax",
            "jnz 2f",
            // Child: rax == 0. Zero the frame pointer so backtraces
            // terminate here, then unpack the start frame.
            "xor ebp, ebp",
            "pop rax",            // entry function
            "pop rdi",            // argument
            "and rsp, -16",
            "call rax",
            // Entry returned: exit this thread with its return value.
            "mov edi, eax",
            "mov eax, 60",        // SYS_exit
            "syscall",
            "ud2",
            "2:",
            ctid = in(reg) child_tid,
            tls = in(reg) tls,
            in("rdi") flags,
            in("rsi") child_sp,
            in("rdx") parent_tid,
            lateout("rax") ret,
            lateout("rcx") _,
            lateout("r11") _,
            options(nostack),
        );
    }
    ret
}

/// Unmap `[base, base + len)` and exit the calling thread, touching no
/// memory in between.
///
/// This is the tail of a context that has to free the very stack it is
/// executing on: a normal `munmap` wrapper would return onto unmapped
/// pages. Both syscalls here run purely out of registers (the musl
/// `__unmapself` trick).
///
/// # Safety
///
/// `base`/`len` must describe a mapping obtained from `mmap`. Nothing
/// on the current stack may be needed again: this function does not
/// return and runs no destructors.
#[inline]
pub unsafe fn unmap_self_exit_asm(base: usize, len: usize) -> ! {
    // SAFETY: after the munmap the remaining instructions use only
    // registers and the (still-mapped) code pages.
    unsafe {
        asm!(
            "mov eax, 11",        // SYS_munmap(base, len)
            "syscall",
            "xor edi, edi",
            "mov eax, 60",        // SYS_exit(0)
            "syscall",
            "ud2",
            in("rdi") base,
            in("rsi") len,
            options(nostack, noreturn),
        );
    }
}
