//! Task entity
//!
//! A task is the kernel-side record of one process: its identity, its
//! descriptor table, its pending syscalls and the worker it runs in.

use crate::fd_table::FdTable;
use crate::syscall::{CancelToken, SyscallContext};
use core_types::{Environment, Pid, Priority};
use ipc::{InitMessage, KernelPort, SyscallId, SyscallMessage, WorkerMessage, PROTOCOL_VERSION};
use kernel_api::{TaskSpec, Worker};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Constructed, worker not started yet
    Created,
    /// Waiting in the run queue
    Runnable,
    /// Waiting for a syscall completion
    Blocked,
    /// Exited; kept as a zombie until reaped
    Exited,
}

/// Outcome of admitting a new request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accepted,
    /// Admitted so it can be answered, but over the pending limit
    OverLimit,
    /// The id is already pending
    Duplicate,
}

/// A parent blocked in `wait4`
pub(crate) struct Waiter {
    /// `None` waits for any child
    pub(crate) target: Option<Pid>,
    pub(crate) ctx: SyscallContext,
}

pub struct Task {
    pid: Pid,
    ppid: Option<Pid>,
    exe_path: String,
    args: Vec<String>,
    env: Environment,
    pub(crate) cwd: String,
    pub(crate) priority: Priority,
    pub(crate) files: FdTable,
    state: TaskState,
    exit_code: Option<i32>,
    worker: Option<Box<dyn Worker>>,
    port: KernelPort,
    cancel: CancelToken,
    started: bool,
    pending: HashSet<SyscallId>,
    outbox: VecDeque<SyscallMessage>,
    pub(crate) children: BTreeSet<Pid>,
    pub(crate) waiters: Vec<Waiter>,
}

impl Task {
    pub(crate) fn new(
        pid: Pid,
        spec: &TaskSpec,
        files: FdTable,
        worker: Box<dyn Worker>,
        port: KernelPort,
    ) -> Self {
        Self {
            pid,
            ppid: spec.parent,
            exe_path: spec.exe_path.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
            priority: spec.priority,
            files,
            state: TaskState::Created,
            exit_code: None,
            worker: Some(worker),
            port,
            cancel: CancelToken::new(),
            started: false,
            pending: HashSet::new(),
            outbox: VecDeque::new(),
            children: BTreeSet::new(),
            waiters: Vec::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn ppid(&self) -> Option<Pid> {
        self.ppid
    }

    pub fn exe_path(&self) -> &str {
        &self.exe_path
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn files(&self) -> &FdTable {
        &self.files
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn is_exited(&self) -> bool {
        self.state == TaskState::Exited
    }

    pub fn port(&self) -> &KernelPort {
        &self.port
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: SyscallId) -> bool {
        self.pending.contains(&id)
    }

    pub(crate) fn orphan(&mut self) {
        self.ppid = None;
    }

    pub(crate) fn mark_runnable(&mut self) {
        if !self.is_exited() {
            self.state = TaskState::Runnable;
        }
    }

    /// Records `id` as pending
    pub(crate) fn admit(&mut self, id: SyscallId, limit: usize) -> Admission {
        if self.pending.contains(&id) {
            return Admission::Duplicate;
        }
        let over = self.pending.len() >= limit;
        self.pending.insert(id);
        if over {
            Admission::OverLimit
        } else {
            Admission::Accepted
        }
    }

    /// Routes a completion to its pending call
    ///
    /// Returns false (and drops the message) when the task has exited or the
    /// id is not pending.
    pub fn schedule(&mut self, message: SyscallMessage) -> bool {
        if self.is_exited() || !self.pending.remove(&message.id) {
            return false;
        }
        self.outbox.push_back(message);
        true
    }

    pub fn has_deliveries(&self) -> bool {
        !self.started || !self.outbox.is_empty()
    }

    fn init_message(&self) -> InitMessage {
        InitMessage {
            version: PROTOCOL_VERSION,
            pid: self.pid,
            exe_path: self.exe_path.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }

    /// Gives the task its CPU slot: starts the worker on first run, then
    /// delivers queued completions in arrival order
    pub(crate) fn run(&mut self) {
        if self.is_exited() {
            return;
        }
        let init = if self.started {
            None
        } else {
            self.started = true;
            Some(self.init_message())
        };
        let deliveries: Vec<SyscallMessage> = self.outbox.drain(..).collect();
        self.state = TaskState::Blocked;

        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        if let Some(init) = init {
            worker.post_message(WorkerMessage::Init(init));
        }
        for message in deliveries {
            worker.post_message(WorkerMessage::Completion(message));
        }
    }

    /// Moves the task to Exited; returns false if it already was
    ///
    /// Cancels outstanding work, stops the worker and closes every descriptor.
    pub(crate) fn mark_exited(&mut self, code: i32) -> bool {
        if self.is_exited() {
            return false;
        }
        self.state = TaskState::Exited;
        self.exit_code = Some(code);
        self.cancel.cancel();
        self.pending.clear();
        self.outbox.clear();
        self.waiters.clear();
        if let Some(mut worker) = self.worker.take() {
            worker.terminate();
        }
        self.files.close_all();
        true
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("ppid", &self.ppid)
            .field("exe_path", &self.exe_path)
            .field("state", &self.state)
            .field("exit_code", &self.exit_code)
            .field("pending", &self.pending.len())
            .finish()
    }
}
