//! Kernel error types

use core_types::{Fd, Pid};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error numbers reported to workers
///
/// Values follow Linux so worker-side libc shims can use them unchanged.
/// On the wire an error is the negated code in the first completion argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Errno {
    EPERM,
    ENOENT,
    ESRCH,
    EIO,
    EBADF,
    ECHILD,
    EAGAIN,
    EACCES,
    EEXIST,
    ENODEV,
    ENOTDIR,
    EISDIR,
    EINVAL,
    EMFILE,
    ESPIPE,
    EPIPE,
    ENOSYS,
    EPROTO,
    ENOTSOCK,
    EADDRINUSE,
    EISCONN,
    ENOTCONN,
    ECONNREFUSED,
}

impl Errno {
    const TABLE: [(Errno, i32); 23] = [
        (Errno::EPERM, 1),
        (Errno::ENOENT, 2),
        (Errno::ESRCH, 3),
        (Errno::EIO, 5),
        (Errno::EBADF, 9),
        (Errno::ECHILD, 10),
        (Errno::EAGAIN, 11),
        (Errno::EACCES, 13),
        (Errno::EEXIST, 17),
        (Errno::ENODEV, 19),
        (Errno::ENOTDIR, 20),
        (Errno::EISDIR, 21),
        (Errno::EINVAL, 22),
        (Errno::EMFILE, 24),
        (Errno::ESPIPE, 29),
        (Errno::EPIPE, 32),
        (Errno::ENOSYS, 38),
        (Errno::EPROTO, 71),
        (Errno::ENOTSOCK, 88),
        (Errno::EADDRINUSE, 98),
        (Errno::EISCONN, 106),
        (Errno::ENOTCONN, 107),
        (Errno::ECONNREFUSED, 111),
    ];

    /// Positive error number
    pub fn code(self) -> i32 {
        Self::TABLE
            .iter()
            .find(|(errno, _)| *errno == self)
            .map(|(_, code)| *code)
            .unwrap_or(5)
    }

    /// Looks up an error number (sign ignored)
    pub fn from_code(code: i32) -> Option<Errno> {
        let code = code.checked_abs()?;
        Self::TABLE
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(errno, _)| *errno)
    }

    /// The value placed in the error slot of a completion
    pub fn wire_value(self) -> i64 {
        -(self.code() as i64)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failure of an operation on a capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{errno}: {message}")]
pub struct CapabilityError {
    pub errno: Errno,
    pub message: String,
}

impl CapabilityError {
    pub fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }
}

impl From<Errno> for CapabilityError {
    fn from(errno: Errno) -> Self {
        Self {
            errno,
            message: errno.to_string(),
        }
    }
}

/// Errors that can occur when interacting with the kernel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    /// No handler registered under this syscall name
    #[error("Unknown syscall: {0}")]
    UnknownSyscall(String),

    /// Arguments did not decode into the syscall's payload
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// Descriptor is not open in the calling task
    #[error("Bad file descriptor: {0}")]
    BadDescriptor(Fd),

    /// Task does not exist (or has already been reaped)
    #[error("No such task: {0}")]
    NoSuchTask(Pid),

    /// Caller has no child matching the wait request
    #[error("No child processes")]
    NoChild,

    /// Task spawn failed
    #[error("Failed to spawn task: {0}")]
    SpawnFailed(String),

    /// No device factory is registered for this kind
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Malformed envelope or duplicate request id
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A policy rejected the operation
    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    /// Capability operation failed
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),
}

impl KernelError {
    /// Error number reported to a worker for this error
    pub fn errno(&self) -> Errno {
        match self {
            KernelError::UnknownSyscall(_) => Errno::ENOSYS,
            KernelError::InvalidArgs(_) => Errno::EINVAL,
            KernelError::BadDescriptor(_) => Errno::EBADF,
            KernelError::NoSuchTask(_) => Errno::ESRCH,
            KernelError::NoChild => Errno::ECHILD,
            KernelError::SpawnFailed(_) => Errno::ENOENT,
            KernelError::UnsupportedDevice(_) => Errno::ENODEV,
            KernelError::Protocol(_) => Errno::EPROTO,
            KernelError::ResourceExhausted(_) => Errno::EAGAIN,
            KernelError::PolicyDenied(_) => Errno::EACCES,
            KernelError::Capability(err) => err.errno,
        }
    }
}

impl From<KernelError> for CapabilityError {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::Capability(err) => err,
            other => CapabilityError::new(other.errno(), other.to_string()),
        }
    }
}
