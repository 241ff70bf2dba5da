//! Syscall wire schema
//!
//! A request is `{ id, name, args }`; its response reuses the `id` and omits
//! `name`. The presence of `name` is the only thing that tells the two apart
//! on the shared worker channel.

use core_types::{Environment, Pid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Version of the worker protocol spoken by this kernel
pub const PROTOCOL_VERSION: SchemaVersion = SchemaVersion::new(1, 0);

/// Correlation id of a syscall
///
/// Chosen by the worker; unique among the requests a task has pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyscallId(u64);

impl SyscallId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SyscallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Syscall({})", self.0)
    }
}

/// Schema version for the worker protocol
///
/// Same major version = compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersion {
    /// Major version (breaking changes)
    pub major: u32,
    /// Minor version (backward-compatible additions)
    pub minor: u32,
}

impl SchemaVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible_with(&self, other: &SchemaVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

/// A syscall request or completion as it crosses the worker boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallMessage {
    pub id: SyscallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub args: Vec<Value>,
}

impl SyscallMessage {
    /// Creates a request envelope
    pub fn request(id: SyscallId, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            id,
            name: Some(name.into()),
            args,
        }
    }

    /// Creates a response envelope (no name)
    pub fn response(id: SyscallId, args: Vec<Value>) -> Self {
        Self {
            id,
            name: None,
            args,
        }
    }

    pub fn is_request(&self) -> bool {
        self.name.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.name.is_none()
    }

    /// Renders the envelope as the raw value a worker posts
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Start-up message posted to a worker before any completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    pub version: SchemaVersion,
    pub pid: Pid,
    pub exe_path: String,
    pub args: Vec<String>,
    pub env: Environment,
    pub cwd: String,
}

/// Everything the kernel posts to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Init(InitMessage),
    Completion(SyscallMessage),
}

impl WorkerMessage {
    /// Returns the completion carried by this message, if any
    pub fn as_completion(&self) -> Option<&SyscallMessage> {
        match self {
            WorkerMessage::Completion(message) => Some(message),
            WorkerMessage::Init(_) => None,
        }
    }
}
