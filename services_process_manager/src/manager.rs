//! Process manager runtime.

use crate::{resolve_command, ProcessHandle};
use core_types::{Environment, OutputStream, Pid};
use kernel_api::{KernelApi, KernelError, KernelEvent, StdioSpec, TaskSpec};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Receives output chunks in write order
pub type OutputCallback = Box<dyn FnMut(Pid, &str)>;

/// Receives the exit code once, after all of the process's output
pub type ExitCallback = Box<dyn FnOnce(Pid, i32)>;

/// Exit code reported when the manager stops a process
const TERMINATED: i32 = 128 + 15;

const DEFAULT_MAX_STEPS: usize = 10_000;

#[derive(Debug, Error)]
pub enum ProcessManagerError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Process not running: {0}")]
    NotRunning(Pid),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
}

/// Options for [`ProcessManager::system`]
///
/// Omitted paths keep the default streams: stdin is empty, stdout and
/// stderr are captured and streamed to the callbacks.
#[derive(Default)]
pub struct SystemArgs {
    pub on_exit: Option<ExitCallback>,
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
    pub stdin_path: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
}

impl SystemArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_exit(mut self, cb: impl FnOnce(Pid, i32) + 'static) -> Self {
        self.on_exit = Some(Box::new(cb));
        self
    }

    pub fn on_stdout(mut self, cb: impl FnMut(Pid, &str) + 'static) -> Self {
        self.on_stdout = Some(Box::new(cb));
        self
    }

    pub fn on_stderr(mut self, cb: impl FnMut(Pid, &str) + 'static) -> Self {
        self.on_stderr = Some(Box::new(cb));
        self
    }

    pub fn stdin_path(mut self, path: impl Into<String>) -> Self {
        self.stdin_path = Some(path.into());
        self
    }

    pub fn stdout_path(mut self, path: impl Into<String>) -> Self {
        self.stdout_path = Some(path.into());
        self
    }

    pub fn stderr_path(mut self, path: impl Into<String>) -> Self {
        self.stderr_path = Some(path.into());
        self
    }

    fn stdio(&self) -> Vec<StdioSpec> {
        let output = |path: &Option<String>, stream| match path {
            Some(path) => StdioSpec::Path(path.clone()),
            None => StdioSpec::Capture(stream),
        };
        vec![
            self.stdin_path
                .clone()
                .map_or(StdioSpec::Null, StdioSpec::Path),
            output(&self.stdout_path, OutputStream::Stdout),
            output(&self.stderr_path, OutputStream::Stderr),
        ]
    }
}

impl fmt::Debug for SystemArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemArgs")
            .field("on_exit", &self.on_exit.is_some())
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .field("stdin_path", &self.stdin_path)
            .field("stdout_path", &self.stdout_path)
            .field("stderr_path", &self.stderr_path)
            .finish()
    }
}

/// Decodes a byte stream whose characters may straddle chunk boundaries
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    /// Appends `chunk` and returns every complete character decoded so far
    ///
    /// Invalid sequences become U+FFFD; a trailing incomplete sequence is
    /// held back until the next chunk.
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.pending.clear();
                    return text;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return text;
                        }
                    }
                }
            }
        }
    }

    /// Whatever is still held back, decoded lossily
    fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

struct Tracked {
    handle: ProcessHandle,
    on_exit: Option<ExitCallback>,
    on_stdout: Option<OutputCallback>,
    on_stderr: Option<OutputCallback>,
    stdout: Utf8Stream,
    stderr: Utf8Stream,
}

impl Tracked {
    fn emit(&mut self, pid: Pid, stream: OutputStream, text: String) {
        let callback = match stream {
            OutputStream::Stdout => self.on_stdout.as_mut(),
            OutputStream::Stderr => self.on_stderr.as_mut(),
        };
        if let Some(callback) = callback.filter(|_| !text.is_empty()) {
            callback(pid, &text);
        }
    }

    fn output(&mut self, pid: Pid, stream: OutputStream, chunk: &[u8]) {
        let text = match stream {
            OutputStream::Stdout => self.stdout.push(chunk),
            OutputStream::Stderr => self.stderr.push(chunk),
        };
        self.emit(pid, stream, text);
    }

    /// Flushes held-back bytes ahead of the exit callback
    fn flush(&mut self, pid: Pid) {
        let text = self.stdout.finish();
        self.emit(pid, OutputStream::Stdout, text);
        let text = self.stderr.finish();
        self.emit(pid, OutputStream::Stderr, text);
    }
}

/// Starts commands and routes their output and exit to callbacks
pub struct ProcessManager {
    processes: BTreeMap<Pid, Tracked>,
    env: Environment,
    cwd: String,
    max_steps: usize,
}

impl ProcessManager {
    /// A manager whose commands run in `/` with `PATH` and `HOME` set
    pub fn new() -> Self {
        Self {
            processes: BTreeMap::new(),
            env: Environment::new()
                .with("PATH", crate::BIN_DIR)
                .with("HOME", "/"),
            cwd: "/".to_string(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_env(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Bounds [`ProcessManager::run_until_idle`]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Starts `cmd` and tracks it until its exit is pumped
    pub fn system<K: KernelApi>(
        &mut self,
        kernel: &mut K,
        cmd: &str,
        args: SystemArgs,
    ) -> Result<Pid, ProcessManagerError> {
        let line = resolve_command(cmd)?;
        let spec = TaskSpec::new(line.exe_path)
            .with_args(line.args)
            .with_env(self.env.clone())
            .with_cwd(self.cwd.clone())
            .with_files(args.stdio());

        let pid = kernel.spawn(spec)?;
        log::info!("system: {} started as {}", cmd, pid);
        self.processes.insert(
            pid,
            Tracked {
                handle: ProcessHandle::new(pid, cmd),
                on_exit: args.on_exit,
                on_stdout: args.on_stdout,
                on_stderr: args.on_stderr,
                stdout: Utf8Stream::default(),
                stderr: Utf8Stream::default(),
            },
        );
        Ok(pid)
    }

    /// Drains kernel events and runs the callbacks they trigger
    ///
    /// Returns the number of events that reached a tracked process.
    pub fn pump<K: KernelApi>(&mut self, kernel: &mut K) -> usize {
        let mut dispatched = 0;
        for event in kernel.drain_events() {
            match event {
                KernelEvent::Output { pid, stream, chunk } => {
                    let Some(tracked) = self.processes.get_mut(&pid) else {
                        continue;
                    };
                    dispatched += 1;
                    tracked.output(pid, stream, &chunk);
                }
                KernelEvent::Exited { pid, code } => {
                    let Some(mut tracked) = self.processes.remove(&pid) else {
                        continue;
                    };
                    dispatched += 1;
                    tracked.flush(pid);
                    tracked.handle.mark_exited(code);
                    log::info!("system: {} exited with {}", pid, code);
                    if let Some(on_exit) = tracked.on_exit.take() {
                        on_exit(pid, code);
                    }
                }
            }
        }
        dispatched
    }

    /// Alternates kernel steps and [`ProcessManager::pump`] until the
    /// kernel goes idle; returns the number of productive steps
    pub fn run_until_idle<K: KernelApi>(&mut self, kernel: &mut K) -> usize {
        let mut steps = 0;
        while steps < self.max_steps {
            let progressed = kernel.step();
            self.pump(kernel);
            if !progressed {
                return steps;
            }
            steps += 1;
        }
        log::warn!("system: still busy after {} steps", steps);
        steps
    }

    /// Stops a tracked process; its exit is reported on the next pump
    pub fn kill<K: KernelApi>(&mut self, kernel: &mut K, pid: Pid) -> Result<(), ProcessManagerError> {
        if !self.processes.contains_key(&pid) || !kernel.is_alive(pid) {
            return Err(ProcessManagerError::NotRunning(pid));
        }
        kernel.exit(pid, TERMINATED);
        Ok(())
    }

    /// Pids whose exit has not been reported yet
    pub fn running(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    pub fn is_running(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn handle(&self, pid: Pid) -> Option<&ProcessHandle> {
        self.processes.get(&pid).map(|tracked| &tracked.handle)
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
