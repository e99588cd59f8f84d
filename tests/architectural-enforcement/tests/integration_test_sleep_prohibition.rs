//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code never blocks a thread with `std::thread::sleep`.
//! Async sleeps are timers and only appear where waiting is the behavior:
//! - `rate_limit.rs`: waiting for the next token refill
//! - `failure.rs`: the circuit reset timer
//! - `pipeline.rs`: retry backoff
//! - `workload.rs`: simulated model latency
//!
//! Everything else waits on channels, `interval.tick()` or `JoinHandle`s.

use std::path::Path;

use architectural_enforcement::{production_dirs, report, scan};

const TIMER_FILES: &[&str] = &["rate_limit.rs", "failure.rs", "pipeline.rs", "workload.rs"];

fn is_timer_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| TIMER_FILES.contains(&name))
}

#[test]
fn test_no_thread_sleep_in_production_code() {
    let violations = scan(&production_dirs(), |_, code| {
        code.contains("thread::sleep(")
    });
    report("Blocking thread::sleep in production code", &violations);
}

#[test]
fn test_async_sleep_only_in_timer_contexts() {
    let violations = scan(&production_dirs(), |path, code| {
        (code.contains("::sleep(") || code.contains("::sleep_until("))
            && !code.contains("thread::sleep(")
            && !is_timer_file(path)
    });
    report(
        "tokio::time::sleep outside the limiter, breaker, backoff and simulation timers",
        &violations,
    );
}
