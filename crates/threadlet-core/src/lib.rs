//! # threadlet-core
//!
//! A minimal thread library built directly on three Linux primitives:
//! the `clone` syscall for starting a new execution context, an
//! anonymous `mmap` region as that context's stack, and `futex` for
//! blocking until a word of memory changes.
//!
//! The API is the create/join/detach triad: [`thread::spawn`] starts a
//! context running a user function, [`thread::ThreadHandle::join`]
//! blocks until it finishes and retrieves its result, and
//! [`thread::ThreadHandle::detach`] hands stack reclamation over to
//! whichever party observes completion last. Reclaim is arbitrated by a
//! single atomic claim flag rather than a lock — see `thread` for the
//! protocol.
//!
//! x86_64 Linux only: the syscall veneer is inline assembly.

#![deny(unsafe_code)]

pub mod error;
#[allow(unsafe_code)]
#[cfg(target_arch = "x86_64")]
pub mod futex;
#[allow(unsafe_code)]
#[cfg(target_arch = "x86_64")]
pub mod stack;
#[allow(unsafe_code)]
#[cfg(target_arch = "x86_64")]
pub mod syscall;
#[allow(unsafe_code)]
#[cfg(target_arch = "x86_64")]
pub mod thread;

pub use error::ThreadError;
#[cfg(target_arch = "x86_64")]
pub use thread::{spawn, ThreadEntry, ThreadHandle};
