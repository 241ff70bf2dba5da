//! Kill Tests
//!
//! Validates that a task blocked in a syscall can be killed, that its
//! blocked call never completes, and that its parent observes the signal.

use core_types::{Environment, Fd, Pid};
use kernel_api::{Errno, KernelApi, KernelEvent, SyscallRequest};
use serde_json::{json, Value};
use tests_resilience::Harness;

fn fd_at(values: &[Value], index: usize) -> Fd {
    Fd::new(values[index].as_u64().expect("fd") as u32)
}

/// Test: SIGKILL during a blocked read
///
/// This validates that:
/// 1. The blocked read is abandoned, not completed
/// 2. The exit code is 128 + signal
/// 3. The parent reaps the child with that code
#[test]
fn test_kill_during_blocked_read() {
    let mut harness = Harness::new();
    let parent = harness.start("/usr/bin/parent");
    let child = harness.spawn_child(parent);

    let fds = harness
        .call(child, SyscallRequest::Pipe2 { flags: 0 })
        .expect("pipe2 never completed")
        .expect("pipe2 failed");
    let reader = Fd::new(fds[0].as_u64().expect("fd") as u32);
    let blocked = SyscallRequest::Read {
        fd: reader,
        len: 64,
        position: None,
    };
    assert_eq!(harness.call(child, blocked), None);

    assert_eq!(
        harness.call(
            parent,
            SyscallRequest::Kill {
                pid: child.as_u32(),
                signal: 9
            }
        ),
        Some(Ok(vec![]))
    );
    assert!(harness.loader.is_terminated(child));
    assert_eq!(harness.loader.completions(child).len(), 1);
    assert!(harness
        .kernel
        .drain_events()
        .contains(&KernelEvent::Exited { pid: child, code: 137 }));

    assert_eq!(
        harness.call(
            parent,
            SyscallRequest::Wait4 {
                pid: i64::from(child.as_u32()),
                options: 0
            }
        ),
        Some(Ok(vec![json!(child.as_u32()), json!(137)]))
    );
    assert!(harness.kernel.task(child).is_none());
}

/// Test: A parent blocked in wait4 is woken by its child's death
#[test]
fn test_kill_wakes_waiting_parent() {
    let mut harness = Harness::new();
    let parent = harness.start("/usr/bin/parent");
    let child = harness.spawn_child(parent);

    let wait = SyscallRequest::Wait4 { pid: -1, options: 0 };
    assert_eq!(harness.call(parent, wait), None);

    harness.kernel.exit(child, 143);
    harness.kernel.run_until_idle();

    assert_eq!(
        harness.results(parent).last().cloned(),
        Some(Ok(vec![json!(child.as_u32()), json!(143)]))
    );
    assert_eq!(
        harness.call(parent, SyscallRequest::Wait4 { pid: -1, options: 0 }),
        Some(Err(Errno::ECHILD))
    );
}

/// Test: A killed reader does not swallow data meant for the survivors
///
/// This validates that:
/// 1. The exited child's parked read takes no bytes
/// 2. The write still lands in the pipe
/// 3. The parent, sharing the read end, receives the byte
#[test]
fn test_killed_reader_leaves_pipe_data_for_survivor() {
    let mut harness = Harness::new();
    let parent = harness.start("/usr/bin/parent");

    let fds = harness
        .call(parent, SyscallRequest::Pipe2 { flags: 0 })
        .expect("pipe2 never completed")
        .expect("pipe2 failed");
    let (reader, writer) = (fd_at(&fds, 0), fd_at(&fds, 1));

    let spawned = harness
        .call(
            parent,
            SyscallRequest::Spawn {
                cwd: "/".to_string(),
                path: "/usr/bin/child".to_string(),
                args: vec![],
                env: Environment::new(),
                files: vec![reader],
            },
        )
        .expect("spawn never completed")
        .expect("spawn failed");
    let child = spawned[0]
        .as_u64()
        .and_then(|raw| Pid::from_raw(raw as u32))
        .expect("spawn returned no pid");

    let blocked = SyscallRequest::Read {
        fd: Fd::STDIN,
        len: 8,
        position: None,
    };
    assert_eq!(harness.call(child, blocked), None);

    harness.kernel.exit(child, 137);
    harness.kernel.run_until_idle();
    assert!(harness.loader.is_terminated(child));

    assert_eq!(
        harness.call(
            parent,
            SyscallRequest::Write {
                fd: writer,
                data: b"x".to_vec()
            }
        ),
        Some(Ok(vec![json!(1)]))
    );
    assert_eq!(
        harness.call(
            parent,
            SyscallRequest::Read {
                fd: reader,
                len: 8,
                position: None
            }
        ),
        Some(Ok(vec![json!("x")]))
    );
    assert!(harness.loader.completions(child).is_empty());
}
