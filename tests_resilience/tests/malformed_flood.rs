//! Malformed Message Tests
//!
//! Validates that a worker posting garbage is contained: nothing it sends
//! reaches a handler, and other tasks keep being served.

use kernel::{KernelConfig, MalformedPolicy, SyscallEvent};
use kernel_api::{Errno, KernelApi, SyscallRequest};
use serde_json::{json, Value};
use tests_resilience::Harness;

fn garbage() -> Vec<Value> {
    vec![
        json!(null),
        json!(42),
        json!("getpid"),
        json!([1, "getpid", []]),
        json!({ "name": "getpid", "args": [] }),
        json!({ "id": -1, "name": "getpid", "args": [] }),
        json!({ "id": 3, "args": [] }),
        json!({ "id": 4, "name": 7, "args": [] }),
        json!({ "id": 5, "name": "getpid", "args": {} }),
    ]
}

/// Test: A flood of malformed envelopes is dropped without side effects
///
/// This validates that:
/// 1. No malformed message produces a completion under the default policy
/// 2. Every dropped message is audited against the sender
/// 3. The noisy task and its neighbours still get answers afterwards
#[test]
fn test_garbage_flood_is_contained() {
    let mut harness = Harness::new();
    let noisy = harness.start("/usr/bin/noisy");
    let quiet = harness.start("/usr/bin/quiet");

    let garbage = garbage();
    for _ in 0..20 {
        for raw in &garbage {
            assert!(harness.loader.post(noisy, raw.clone()));
        }
    }
    harness.kernel.run_until_idle();

    assert!(harness.loader.completions(noisy).is_empty());
    let dropped = harness.kernel.audit_log().count_events(
        |event| matches!(event, SyscallEvent::Dropped { pid, .. } if *pid == noisy),
    );
    assert_eq!(dropped, 20 * garbage.len());
    assert!(!harness
        .kernel
        .audit_log()
        .has_event(|event| matches!(event, SyscallEvent::Invoked { .. })));

    assert_eq!(
        harness.call(quiet, SyscallRequest::Getpid),
        Some(Ok(vec![json!(quiet.as_u32())]))
    );
    assert_eq!(
        harness.call(noisy, SyscallRequest::Getpid),
        Some(Ok(vec![json!(noisy.as_u32())]))
    );
    assert!(harness.kernel.is_alive(noisy));
}

/// Test: Under the reporting policy every identifiable envelope gets EPROTO
#[test]
fn test_reported_envelopes_complete_once() {
    let mut harness = Harness::with_config(
        KernelConfig::default().with_malformed_envelopes(MalformedPolicy::Report),
    );
    let pid = harness.start("/usr/bin/noisy");

    for id in 100..150 {
        assert!(harness.loader.post(pid, json!({ "id": id, "name": "getpid" })));
    }
    // No id: nothing to answer
    assert!(harness.loader.post(pid, json!({ "name": "getpid", "args": [] })));
    harness.kernel.run_until_idle();

    let results = harness.results(pid);
    assert_eq!(results.len(), 50);
    assert!(results.iter().all(|result| *result == Err(Errno::EPROTO)));
    assert_eq!(harness.kernel.task(pid).map(|task| task.pending_count()), Some(0));
    assert_eq!(
        harness
            .kernel
            .audit_log()
            .count_events(|event| matches!(event, SyscallEvent::Dropped { .. })),
        1
    );
}

/// Test: Garbage posted after exit never resurrects the task
#[test]
fn test_flood_after_exit_is_ignored() {
    let mut harness = Harness::new();
    let pid = harness.start("/usr/bin/noisy");
    harness.kernel.exit(pid, 0);
    harness.kernel.run_until_idle();
    harness.kernel.drain_events();

    for raw in garbage() {
        harness.loader.post(pid, raw);
    }
    harness.loader.request(pid, 999, SyscallRequest::Getpid);
    harness.kernel.run_until_idle();

    assert!(harness.loader.completions(pid).is_empty());
    assert!(harness.kernel.drain_events().is_empty());
    assert!(!harness.kernel.is_alive(pid));
}

/// Test: A long flood keeps the audit trails within their capacity
///
/// This validates that:
/// 1. The syscall trail never grows past its capacity
/// 2. The oldest events are the ones evicted
/// 3. The scheduler trail is bounded the same way
#[test]
fn test_flood_keeps_audit_bounded() {
    let mut harness = Harness::with_config(KernelConfig::default().with_audit_capacity(32));
    let noisy = harness.start("/usr/bin/noisy");

    let garbage = garbage();
    for _ in 0..50 {
        for raw in &garbage {
            assert!(harness.loader.post(noisy, raw.clone()));
        }
        harness.kernel.run_until_idle();
    }
    let audit = harness.kernel.audit_log();
    assert_eq!(audit.len(), 32);
    assert_eq!(audit.evicted(), (50 * garbage.len() - 32) as u64);

    assert_eq!(
        harness.call(noisy, SyscallRequest::Getpid),
        Some(Ok(vec![json!(noisy.as_u32())]))
    );
    let audit = harness.kernel.audit_log();
    assert_eq!(audit.len(), 32);
    assert!(matches!(
        audit.events().back(),
        Some(SyscallEvent::Completed { pid, .. }) if *pid == noisy
    ));
    assert!(harness.kernel.scheduler().audit_log().len() <= 32);
}
