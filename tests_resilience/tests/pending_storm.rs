//! Pending Limit Tests
//!
//! Validates that a task issuing far more concurrent calls than allowed is
//! throttled with EAGAIN, and that the throttling is per task.

use core_types::{Fd, Pid};
use kernel::KernelConfig;
use kernel_api::{Errno, KernelApi, KernelEvent, SyscallRequest};
use serde_json::json;
use tests_resilience::Harness;

fn open_pipe(harness: &mut Harness, pid: Pid) -> (Fd, Fd) {
    let fds = harness
        .call(pid, SyscallRequest::Pipe2 { flags: 0 })
        .expect("pipe2 never completed")
        .expect("pipe2 failed");
    let fd = |index: usize| Fd::new(fds[index].as_u64().expect("fd") as u32);
    (fd(0), fd(1))
}

fn blocked_read(fd: Fd) -> SyscallRequest {
    SyscallRequest::Read {
        fd,
        len: 8,
        position: None,
    }
}

/// Test: Excess calls fail fast and the limit holds afterwards
///
/// This validates that:
/// 1. Exactly `limit` calls stay pending
/// 2. Every call beyond the limit completes with EAGAIN
/// 3. Exiting releases every pending call without completing it
#[test]
fn test_storm_is_throttled() {
    let mut harness = Harness::with_config(KernelConfig::default().with_max_pending_syscalls(4));
    let pid = harness.start("/usr/bin/storm");
    let (reader, _writer) = open_pipe(&mut harness, pid);

    for _ in 0..14 {
        harness.post(pid, blocked_read(reader));
    }
    harness.kernel.run_until_idle();

    let results = harness.results(pid);
    // pipe2 plus ten rejections
    assert_eq!(results.len(), 11);
    assert!(results[1..].iter().all(|result| *result == Err(Errno::EAGAIN)));
    assert_eq!(harness.kernel.task(pid).map(|task| task.pending_count()), Some(4));

    harness.kernel.exit(pid, 0);
    harness.kernel.run_until_idle();
    let events = harness.kernel.drain_events();
    assert!(events.contains(&KernelEvent::Exited { pid, code: 0 }));
    assert!(harness.kernel.task(pid).is_none());
    assert!(harness.loader.is_terminated(pid));
    assert_eq!(harness.results(pid).len(), 11);
}

/// Test: One task at its limit does not throttle another
#[test]
fn test_limit_is_per_task() {
    let mut harness = Harness::with_config(KernelConfig::default().with_max_pending_syscalls(2));
    let busy = harness.start("/usr/bin/busy");
    let idle = harness.start("/usr/bin/idle");
    let (reader, _writer) = open_pipe(&mut harness, busy);

    harness.post(busy, blocked_read(reader));
    harness.post(busy, blocked_read(reader));
    harness.kernel.run_until_idle();
    assert_eq!(
        harness.call(busy, SyscallRequest::Getpid),
        Some(Err(Errno::EAGAIN))
    );

    assert_eq!(
        harness.call(idle, SyscallRequest::Getpid),
        Some(Ok(vec![json!(idle.as_u32())]))
    );

    harness.kernel.exit(busy, 0);
    harness.kernel.run_until_idle();
    assert!(harness.kernel.is_alive(idle));
}
