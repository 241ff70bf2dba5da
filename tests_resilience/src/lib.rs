//! Resilience Test Utilities
//!
//! This crate provides shared utilities for resilience and integration tests.
//!
//! ## Test Philosophy
//!
//! - **Isolation under abuse**: a misbehaving worker never affects other tasks
//! - **Bounded state**: exited tasks, pending calls and pipes are all released
//! - **Exactly once**: every task reports one exit, every call one completion

use core_types::{Environment, Pid};
use kernel::test_utils::{recording_kernel, RecordingLoader};
use kernel::{Kernel, KernelConfig};
use kernel_api::{split_completion, Errno, KernelApi, SyscallRequest, TaskSpec};
use serde_json::Value;

/// Outcome of a syscall as a worker would see it
pub type CallResult = Result<Vec<Value>, Errno>;

/// A kernel whose workers are driven by hand
pub struct Harness {
    pub kernel: Kernel,
    pub loader: RecordingLoader,
    next_id: u64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        let (kernel, loader) = recording_kernel();
        Self {
            kernel: kernel.with_config(config),
            loader,
            next_id: 1,
        }
    }

    /// Spawns a top-level task and delivers its init message
    pub fn start(&mut self, exe_path: &str) -> Pid {
        let pid = self
            .kernel
            .spawn(TaskSpec::new(exe_path))
            .expect("Failed to spawn task");
        self.kernel.run_until_idle();
        pid
    }

    /// Issues a request without waiting for it
    pub fn post(&mut self, pid: Pid, request: SyscallRequest) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        assert!(self.loader.request(pid, id, request), "worker {} is gone", pid);
        id
    }

    /// Issues a request and runs the kernel until it settles
    ///
    /// Returns `None` when the call is still blocked.
    pub fn call(&mut self, pid: Pid, request: SyscallRequest) -> Option<CallResult> {
        let before = self.loader.completions(pid).len();
        self.post(pid, request);
        self.kernel.run_until_idle();
        let completions = self.loader.completions(pid);
        (completions.len() > before)
            .then(|| split_completion(&completions[completions.len() - 1].args).map(<[Value]>::to_vec))
    }

    /// Spawns a child of `parent` through the `spawn` syscall
    pub fn spawn_child(&mut self, parent: Pid) -> Pid {
        let values = self
            .call(
                parent,
                SyscallRequest::Spawn {
                    cwd: "/".to_string(),
                    path: "/usr/bin/child".to_string(),
                    args: vec![],
                    env: Environment::new(),
                    files: vec![],
                },
            )
            .expect("spawn never completed")
            .expect("spawn failed");
        values
            .first()
            .and_then(Value::as_u64)
            .and_then(|raw| Pid::from_raw(raw as u32))
            .expect("spawn returned no pid")
    }

    /// Results of every completion delivered to `pid`, in order
    pub fn results(&self, pid: Pid) -> Vec<CallResult> {
        self.loader
            .completions(pid)
            .iter()
            .map(|message| split_completion(&message.args).map(<[Value]>::to_vec))
            .collect()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
