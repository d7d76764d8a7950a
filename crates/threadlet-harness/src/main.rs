//! CLI driver for threadlet-core.
//!
//! Exercises the create/join/detach triad from a real process and
//! emits a JSON verdict with the stack accounting, so leak or
//! double-free regressions show up as a nonzero exit instead of a
//! silent pass.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use threadlet_core::{spawn, stack, syscall, ThreadHandle};

/// Driver and accounting harness for threadlet-core.
#[derive(Debug, Parser)]
#[command(name = "threadlet")]
#[command(about = "Exercise clone/mmap/futex thread lifecycle scenarios")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spawn N workers computing id + 1000, join the first half and
    /// verify their results, detach the rest, then check that every
    /// stack was freed exactly once.
    Smoke {
        /// Number of threads to spawn.
        #[arg(long, default_value_t = 100)]
        threads: usize,
    },
    /// Race detach against completion: repeatedly spawn a yielding
    /// worker and detach it immediately, then verify the accounting.
    Churn {
        /// Number of spawn/detach trials.
        #[arg(long, default_value_t = 500)]
        trials: usize,
    },
}

#[derive(Debug, Serialize)]
struct Report {
    scenario: &'static str,
    threads: usize,
    joined: usize,
    detached: usize,
    value_mismatches: usize,
    stacks_mapped: usize,
    stacks_unmapped: usize,
    ok: bool,
}

fn worker(id: usize) -> usize {
    if id % 10 == 0 {
        syscall::sys_sched_yield();
    }
    id + 1000
}

fn yielding_worker(arg: usize) -> usize {
    for _ in 0..(arg % 4) {
        syscall::sys_sched_yield();
    }
    arg
}

/// Wait for detached stragglers to release their stacks.
fn settle() {
    for _ in 0..5000 {
        if stack::stacks_unmapped() == stack::stacks_mapped() {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn run_smoke(threads: usize) -> Report {
    // SAFETY: worker touches nothing thread-local; arg is a plain id.
    let handles: Vec<ThreadHandle> = (0..threads)
        .map(|id| unsafe { spawn(worker, id) }.expect("spawn failed"))
        .collect();

    let mut joined = 0;
    let mut detached = 0;
    let mut value_mismatches = 0;
    for (id, handle) in handles.iter().enumerate() {
        if id < threads / 2 {
            match handle.join() {
                Ok(value) if value == id + 1000 => joined += 1,
                Ok(_) | Err(_) => value_mismatches += 1,
            }
        } else {
            handle.detach().expect("detach failed");
            detached += 1;
        }
    }
    drop(handles);
    settle();

    let mapped = stack::stacks_mapped();
    let unmapped = stack::stacks_unmapped();
    Report {
        scenario: "smoke",
        threads,
        joined,
        detached,
        value_mismatches,
        stacks_mapped: mapped,
        stacks_unmapped: unmapped,
        ok: value_mismatches == 0
            && joined + detached == threads
            && mapped == threads
            && unmapped == threads,
    }
}

fn run_churn(trials: usize) -> Report {
    let mut detached = 0;
    for trial in 0..trials {
        // SAFETY: yielding_worker touches nothing thread-local.
        let handle = unsafe { spawn(yielding_worker, trial) }.expect("spawn failed");
        handle.detach().expect("detach failed");
        detached += 1;
    }
    settle();

    let mapped = stack::stacks_mapped();
    let unmapped = stack::stacks_unmapped();
    Report {
        scenario: "churn",
        threads: trials,
        joined: 0,
        detached,
        value_mismatches: 0,
        stacks_mapped: mapped,
        stacks_unmapped: unmapped,
        ok: detached == trials && mapped == trials && unmapped == trials,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let report = match cli.command {
        Command::Smoke { threads } => run_smoke(threads),
        Command::Churn { trials } => run_churn(trials),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("report serialization")
    );
    if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
