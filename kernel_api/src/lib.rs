//! # Kernel API
//!
//! This crate defines the contracts between the kernel, its host and the
//! resources it brokers.
//!
//! ## Philosophy
//!
//! The kernel provides **mechanisms**, not implementations:
//! - Files, ttys and devices are reached only through capability traits
//! - Workers are reached only through messages
//! - Program images and the backing filesystem are external collaborators
//!
//! ## Design Goals
//!
//! 1. **Testability**: every collaborator can be replaced by an in-memory one
//! 2. **Explicitness**: completions carry either an error or a value, never both
//! 3. **Type safety**: syscall arguments are decoded into typed requests
//!    before any handler runs
//!
//! ## Non-Goals
//!
//! This is NOT:
//! - A filesystem (the backing store is behind [`FileSystem`])
//! - A network stack (only connect/bind/unbind are brokered here)

pub mod capability;
pub mod error;
pub mod kernel;
pub mod syscalls;
pub mod worker;

pub use capability::{
    CancelCheck, Capability, Connection, Device, DeviceHandle, DeviceId, Endpoint, File,
    FileHandle, FileKind, FileStat, IoCallback, IoResult, OpenFlags, Socket, Tty,
};
pub use error::{CapabilityError, Errno, KernelError};
pub use kernel::{ConnectCallback, KernelApi, KernelEvent, StdioSpec, TaskSpec};
pub use syscalls::{
    bytes_from_value, bytes_to_value, split_completion, SyscallRequest, SYSCALL_NAMES, WNOHANG,
};
pub use worker::{FileSystem, ProgramLoader, Worker};
