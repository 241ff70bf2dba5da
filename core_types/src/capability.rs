//! Keep-alive accounting for capabilities
//!
//! Capabilities (files, ttys, devices) are shared between descriptor tables
//! and tasks only through explicit reference counting. The count is separate
//! from Rust's own ownership: a capability whose count drains to zero is
//! merely *eligible* for release. The descriptor table releases it when its
//! owning fd is explicitly closed.
//!
//! ## Example
//!
//! ```
//! use core_types::KeepAlive;
//!
//! let keep_alive = KeepAlive::new();
//! keep_alive.retain();
//! keep_alive.retain();
//! assert_eq!(keep_alive.release(), 1);
//! assert!(!keep_alive.is_drained());
//! ```

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;

/// Explicit keep-alive counter embedded in capability implementations
#[derive(Debug, Default)]
pub struct KeepAlive {
    count: Cell<u32>,
    closed: Cell<bool>,
}

impl KeepAlive {
    /// Creates a counter with no references
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a reference, returning the new count
    pub fn retain(&self) -> u32 {
        let next = self.count.get().saturating_add(1);
        self.count.set(next);
        next
    }

    /// Drops a reference, returning the remaining count
    ///
    /// Releasing an already drained counter stays at zero.
    pub fn release(&self) -> u32 {
        let next = self.count.get().saturating_sub(1);
        self.count.set(next);
        next
    }

    /// Current number of references
    pub fn count(&self) -> u32 {
        self.count.get()
    }

    /// True once every reference has been released
    pub fn is_drained(&self) -> bool {
        self.count.get() == 0
    }

    /// Marks the capability released; true only on the first call
    pub fn mark_closed(&self) -> bool {
        !self.closed.replace(true)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

/// The contract a capability was constructed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    File,
    Tty,
    Device,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::File => write!(f, "file"),
            CapabilityKind::Tty => write!(f, "tty"),
            CapabilityKind::Device => write!(f, "device"),
        }
    }
}
