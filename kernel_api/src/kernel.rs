//! Kernel API trait and task construction types

use crate::capability::{DeviceHandle, Endpoint, FileHandle};
use crate::KernelError;
use core_types::{Environment, OutputStream, Pid, Priority};
use serde_json::Value;
use std::fmt;

/// Callback invoked exactly once when a connect attempt settles
pub type ConnectCallback = Box<dyn FnOnce(Result<(), KernelError>)>;

/// Where one of a new task's descriptors comes from
#[derive(Clone)]
pub enum StdioSpec {
    /// An empty stream: reads hit EOF, writes are discarded
    Null,
    /// A path opened through the filesystem (read for fd 0, write otherwise)
    Path(String),
    /// Captured and reported to the host as output events
    Capture(OutputStream),
    /// An existing capability, shared through a keep-alive reference
    Handle(FileHandle),
}

impl fmt::Debug for StdioSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StdioSpec::Null => write!(f, "Null"),
            StdioSpec::Path(path) => write!(f, "Path({:?})", path),
            StdioSpec::Capture(stream) => write!(f, "Capture({})", stream),
            StdioSpec::Handle(_) => write!(f, "Handle(..)"),
        }
    }
}

/// Descriptor for creating a new task
///
/// Task creation is explicit construction: the program, its arguments and
/// environment, and the capability behind every initial descriptor are
/// spelled out by the caller.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub exe_path: String,
    /// Full argument vector, `args[0]` included
    pub args: Vec<String>,
    pub env: Environment,
    pub cwd: String,
    pub priority: Priority,
    /// Initial descriptors; entry `i` becomes fd `i`
    pub files: Vec<StdioSpec>,
    pub parent: Option<Pid>,
}

impl TaskSpec {
    /// Creates a spec with `args = [exe_path]`, cwd `/`, an empty stdin and
    /// captured stdout/stderr
    pub fn new(exe_path: impl Into<String>) -> Self {
        let exe_path = exe_path.into();
        Self {
            args: vec![exe_path.clone()],
            exe_path,
            env: Environment::new(),
            cwd: "/".to_string(),
            priority: Priority::DEFAULT,
            files: vec![
                StdioSpec::Null,
                StdioSpec::Capture(OutputStream::Stdout),
                StdioSpec::Capture(OutputStream::Stderr),
            ],
            parent: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replaces the spec for descriptor `index`, padding with `Null`
    pub fn with_file(mut self, index: usize, file: StdioSpec) -> Self {
        if self.files.len() <= index {
            self.files.resize(index + 1, StdioSpec::Null);
        }
        self.files[index] = file;
        self
    }

    pub fn with_files(mut self, files: Vec<StdioSpec>) -> Self {
        self.files = files;
        self
    }

    pub fn with_parent(mut self, parent: Pid) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Something the host should observe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// A chunk written to a captured stream, in write order
    Output {
        pid: Pid,
        stream: OutputStream,
        chunk: Vec<u8>,
    },
    /// A task exited; emitted exactly once per task, after its output
    Exited { pid: Pid, code: i32 },
}

impl KernelEvent {
    pub fn pid(&self) -> Pid {
        match self {
            KernelEvent::Output { pid, .. } | KernelEvent::Exited { pid, .. } => *pid,
        }
    }
}

/// The host-facing kernel interface
///
/// Every call runs on the kernel's own thread; workers never call these
/// directly and reach the kernel only through syscall messages.
pub trait KernelApi {
    /// Creates a task and makes it runnable
    fn spawn(&mut self, spec: TaskSpec) -> Result<Pid, KernelError>;

    /// Terminates a task. Idempotent: only the first call has any effect.
    fn exit(&mut self, pid: Pid, code: i32);

    /// Changes a task's priority, returning the previous one
    fn set_priority(&mut self, pid: Pid, priority: Priority) -> Result<Priority, KernelError>;

    /// Drains the inbox and runs up to `n_cpus` tasks; returns whether
    /// anything happened
    fn step(&mut self) -> bool;

    /// Steps until nothing progresses; returns the number of productive steps
    fn run_until_idle(&mut self) -> usize;

    /// Takes the events produced since the last call, in order
    fn drain_events(&mut self) -> Vec<KernelEvent>;

    /// True while the task exists and has not exited
    fn is_alive(&self, pid: Pid) -> bool;

    /// Connects a socket capability; `cb` fires exactly once
    fn connect(&mut self, file: &FileHandle, endpoint: Endpoint, cb: ConnectCallback);

    /// Releases a binding held by a socket capability
    fn unbind(&mut self, file: &FileHandle, endpoint: &Endpoint) -> Result<(), KernelError>;

    /// Attaches a device created by the factory registered for `kind`
    fn hotplug(&mut self, kind: &str, args: &Value) -> Result<DeviceHandle, KernelError>;
}
