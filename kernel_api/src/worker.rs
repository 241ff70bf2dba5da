//! External collaborator contracts
//!
//! Program images, worker contexts and the backing filesystem live outside the
//! kernel. These traits are the only surface it uses to reach them.

use crate::capability::{FileHandle, FileStat, IoResult, OpenFlags};
use crate::error::KernelError;
use crate::kernel::TaskSpec;
use ipc::{WorkerMessage, WorkerPort};

/// An isolated execution context running one task
pub trait Worker {
    /// Delivers a message to the worker; never blocks
    fn post_message(&mut self, message: WorkerMessage);

    /// Stops the worker; later messages are ignored
    fn terminate(&mut self);
}

/// Creates workers from program images
pub trait ProgramLoader {
    /// Loads `spec.exe_path` into a fresh worker that talks back via `port`
    fn load(&self, spec: &TaskSpec, port: WorkerPort) -> Result<Box<dyn Worker>, KernelError>;
}

/// Backing filesystem used by `open` and `stat`
pub trait FileSystem {
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> IoResult<FileHandle>;
    fn stat(&self, path: &str) -> IoResult<FileStat>;
}
