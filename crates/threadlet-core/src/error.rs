//! Error taxonomy for thread lifecycle operations.

use thiserror::Error;

/// Failures reported synchronously by `spawn`, `join`, and `detach`.
///
/// Syscall-level failures carry the raw errno from the kernel. Nothing
/// is retried internally; retry policy belongs to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// The anonymous stack mapping could not be obtained.
    #[error("stack mapping failed (errno {0})")]
    AllocationFailed(i32),

    /// The `clone` syscall failed; the stack was released before
    /// returning and the handle is unusable.
    #[error("clone failed (errno {0})")]
    SpawnFailed(i32),

    /// Join called on a detached handle, join called twice, or detach
    /// called on a joined handle.
    #[error("handle is not joinable in its current state")]
    InvalidState,

    /// The entry function panicked. The unwind is caught inside the
    /// spawned context and reported here instead of crossing the
    /// context boundary.
    #[error("thread entry function panicked")]
    EntryPanicked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_errno() {
        let e = ThreadError::AllocationFailed(12);
        assert_eq!(e.to_string(), "stack mapping failed (errno 12)");
        let e = ThreadError::SpawnFailed(11);
        assert_eq!(e.to_string(), "clone failed (errno 11)");
    }

    #[test]
    fn errors_are_comparable() {
        assert_eq!(ThreadError::InvalidState, ThreadError::InvalidState);
        assert_ne!(
            ThreadError::InvalidState,
            ThreadError::EntryPanicked,
        );
    }
}
