//! # Core Types
//!
//! This crate defines the fundamental types shared by the kernel, its
//! services and the wire protocol.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: pids, fds and priorities are distinct types
//!   and cannot be confused with each other or with plain integers.
//! - **No ambient sharing**: capabilities are shared only through explicit
//!   keep-alive counting.
//!
//! ## Key Types
//!
//! - [`Pid`]: Unique identifier for a task
//! - [`Fd`]: Key into a task's descriptor table
//! - [`Priority`]: Scheduling priority (lower runs sooner)
//! - [`Environment`]: A task's environment variables
//! - [`KeepAlive`]: Explicit reference count carried by capabilities

pub mod capability;
pub mod env;
pub mod ids;
pub mod priority;

pub use capability::{CapabilityKind, KeepAlive};
pub use env::{Environment, OutputStream};
pub use ids::{Fd, Pid};
pub use priority::Priority;
