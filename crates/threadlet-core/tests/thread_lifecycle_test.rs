//! End-to-end lifecycle accounting: spawn a batch, join half, detach
//! the rest, and verify every stack was mapped and released exactly
//! once.
//!
//! Deliberately the only test in this binary: the map/unmap counters
//! are process-wide, so they must not be shared with unrelated tests.

use std::time::Duration;

use threadlet_core::{spawn, stack, syscall, ThreadHandle};

const THREADS: usize = 100;

fn worker(id: usize) -> usize {
    if id % 10 == 0 {
        syscall::sys_sched_yield();
    }
    id + 1000
}

#[test]
#[allow(unsafe_code)]
fn join_half_detach_half_frees_every_stack() {
    assert_eq!(stack::stacks_mapped(), 0, "counters must start clean");

    // SAFETY: worker touches nothing thread-local and arg is a plain
    // integer.
    let handles: Vec<ThreadHandle> = (0..THREADS)
        .map(|id| unsafe { spawn(worker, id) }.expect("spawn should succeed"))
        .collect();
    assert_eq!(stack::stacks_mapped(), THREADS);

    for (id, handle) in handles.iter().enumerate() {
        if id < THREADS / 2 {
            assert_eq!(handle.join(), Ok(id + 1000), "thread {id} result");
        } else {
            handle.detach().expect("detach should succeed");
        }
    }
    drop(handles);

    // Detached contexts release their stacks on their own way out;
    // give stragglers time to finish before checking the books.
    for _ in 0..5000 {
        if stack::stacks_unmapped() == stack::stacks_mapped() {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(stack::stacks_mapped(), THREADS, "no extra mappings");
    assert_eq!(
        stack::stacks_unmapped(),
        THREADS,
        "every stack freed exactly once, none leaked"
    );
}
