//! Capability contracts
//!
//! The kernel never sees how a resource is implemented. It operates on files,
//! ttys and devices only through these traits, and every I/O operation reports
//! back through a one-shot callback carrying `Result<T, CapabilityError>`: an
//! error and no value on failure, a value and no error on success.
//!
//! Callbacks may run before the call returns or much later. An implementation
//! that finishes work outside the kernel thread must marshal the result back
//! through the kernel inbox before invoking the callback.

use crate::error::{CapabilityError, Errno};
use core_types::{CapabilityKind, KeepAlive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;
use uuid::Uuid;

pub type IoResult<T> = Result<T, CapabilityError>;

/// One-shot continuation for a capability operation
pub type IoCallback<T> = Box<dyn FnOnce(IoResult<T>)>;

/// Shared handle to a file capability
pub type FileHandle = Rc<dyn File>;

/// Reports true once the caller of a parked operation has gone away
pub type CancelCheck = Rc<dyn Fn() -> bool>;

/// Kind of object behind a file capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Regular,
    Directory,
    CharDevice,
    Fifo,
    Socket,
}

/// Metadata returned by `stat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
}

impl FileStat {
    pub fn new(kind: FileKind, size: u64, mode: u32) -> Self {
        Self { kind, size, mode }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Decoded `open` flags (Linux bit values)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const O_RDONLY: u32 = 0;
    pub const O_WRONLY: u32 = 0o1;
    pub const O_RDWR: u32 = 0o2;
    pub const O_CREAT: u32 = 0o100;
    pub const O_EXCL: u32 = 0o200;
    pub const O_TRUNC: u32 = 0o1000;
    pub const O_APPEND: u32 = 0o2000;
    const O_ACCMODE: u32 = 0o3;

    pub fn from_bits(bits: u32) -> Self {
        let access = bits & Self::O_ACCMODE;
        Self {
            read: access == Self::O_RDONLY || access == Self::O_RDWR,
            write: access == Self::O_WRONLY || access == Self::O_RDWR,
            create: bits & Self::O_CREAT != 0,
            exclusive: bits & Self::O_EXCL != 0,
            truncate: bits & Self::O_TRUNC != 0,
            append: bits & Self::O_APPEND != 0,
        }
    }

    pub fn bits(&self) -> u32 {
        let mut bits = match (self.read, self.write) {
            (true, true) => Self::O_RDWR,
            (false, true) => Self::O_WRONLY,
            _ => Self::O_RDONLY,
        };
        if self.create {
            bits |= Self::O_CREAT;
        }
        if self.exclusive {
            bits |= Self::O_EXCL;
        }
        if self.truncate {
            bits |= Self::O_TRUNC;
        }
        if self.append {
            bits |= Self::O_APPEND;
        }
        bits
    }

    pub fn read_only() -> Self {
        Self::from_bits(Self::O_RDONLY)
    }

    /// Write-only, created and truncated (shell `>` redirection)
    pub fn write_truncate() -> Self {
        Self::from_bits(Self::O_WRONLY | Self::O_CREAT | Self::O_TRUNC)
    }
}

/// The file contract
///
/// `add_ref`/`unref` adjust the keep-alive count independently of Rust
/// ownership. Draining the count never releases the resource by itself;
/// `close` is called by the descriptor table once it is drained and the
/// owning fd has been closed.
pub trait File {
    fn write(&self, data: &[u8], cb: IoCallback<usize>);

    /// Reads up to `len` bytes at `position`, or at the current offset when
    /// `position` is `None`. An empty result means end of file.
    fn read(&self, len: usize, position: Option<u64>, cb: IoCallback<Vec<u8>>);

    /// `read` for a caller that may exit while the read is parked
    ///
    /// A capability that parks reads must skip a parked read once `cancelled`
    /// returns true, leaving the data for the next live reader.
    fn read_cancellable(
        &self,
        len: usize,
        position: Option<u64>,
        _cancelled: CancelCheck,
        cb: IoCallback<Vec<u8>>,
    ) {
        self.read(len, position, cb)
    }

    fn stat(&self, cb: IoCallback<FileStat>);

    fn readdir(&self, cb: IoCallback<Vec<String>>) {
        cb(Err(CapabilityError::from(Errno::ENOTDIR)))
    }

    fn keep_alive(&self) -> &KeepAlive;

    fn add_ref(&self) {
        self.keep_alive().retain();
    }

    fn unref(&self) {
        self.keep_alive().release();
    }

    /// Releases the underlying resource
    fn close(&self) {}

    fn as_socket(&self) -> Option<&dyn Socket> {
        None
    }
}

/// Address + port pair used by sockets
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// An established connection supplied by the network stack
pub trait Connection {
    fn send(&self, data: &[u8], cb: IoCallback<usize>);
    fn recv(&self, len: usize, cb: IoCallback<Vec<u8>>);
    fn shutdown(&self) {}
}

/// Extra contract of file capabilities that are sockets
pub trait Socket {
    /// Makes the socket usable for I/O over `connection`
    fn attach(&self, connection: Box<dyn Connection>);
    fn is_connected(&self) -> bool;
    fn binding(&self) -> Option<Endpoint>;
    fn set_binding(&self, endpoint: Option<Endpoint>);
}

/// The terminal contract
pub trait Tty {
    fn name(&self) -> &str;
    /// Releases display resources; the pty pair stays alive
    fn close(&self);
    /// `close` plus termination of the processes attached to the tty
    fn kill(&self);
}

/// The device contract
pub trait Device {
    fn kind(&self) -> &str;
    fn name(&self) -> &str;
    /// Opens the device as a file capability
    fn open(&self) -> IoResult<FileHandle>;
    /// Called when the device is detached from the kernel
    fn detach(&self) {}
}

/// A capability selected by contract at construction
#[derive(Clone)]
pub enum Capability {
    File(FileHandle),
    Tty(Rc<dyn Tty>),
    Device(Rc<dyn Device>),
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::File(_) => CapabilityKind::File,
            Capability::Tty(_) => CapabilityKind::Tty,
            Capability::Device(_) => CapabilityKind::Device,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::File(_) => write!(f, "Capability::File"),
            Capability::Tty(tty) => write!(f, "Capability::Tty({})", tty.name()),
            Capability::Device(dev) => {
                write!(f, "Capability::Device({}:{})", dev.kind(), dev.name())
            }
        }
    }
}

/// Identifier of a hotplugged device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.0)
    }
}

/// Handle returned by hotplug
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub kind: CapabilityKind,
    pub device_type: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags_from_bits() {
        let flags = OpenFlags::from_bits(OpenFlags::O_RDWR | OpenFlags::O_CREAT);
        assert!(flags.read);
        assert!(flags.write);
        assert!(flags.create);
        assert!(!flags.truncate);

        let read_only = OpenFlags::from_bits(0);
        assert!(read_only.read);
        assert!(!read_only.write);
    }

    #[test]
    fn test_open_flags_bits_round_trip() {
        let bits = OpenFlags::O_WRONLY | OpenFlags::O_TRUNC | OpenFlags::O_APPEND;
        assert_eq!(OpenFlags::from_bits(bits).bits(), bits);
        assert_eq!(OpenFlags::write_truncate().bits(), 0o1101);
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.1", 80).to_string(), "10.0.0.1:80");
    }

    #[test]
    fn test_file_stat_is_dir() {
        assert!(FileStat::new(FileKind::Directory, 0, 0o755).is_dir());
        assert!(!FileStat::new(FileKind::Regular, 3, 0o644).is_dir());
    }

    #[test]
    fn test_device_ids_unique() {
        assert_ne!(DeviceId::new(), DeviceId::new());
    }
}
