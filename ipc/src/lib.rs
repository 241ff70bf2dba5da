//! # Inter-Process Communication (IPC)
//!
//! This crate defines the message-passing primitives between workers and the
//! kernel.
//!
//! ## Philosophy
//!
//! - **Messages, not shared memory**: workers and the kernel never share state
//! - **Correlated, not ordered**: every request carries an id and completions
//!   are matched on it, never on arrival order
//! - **One inbox**: everything entering the kernel is serialized through a
//!   single FIFO channel
//!
//! ## Architecture
//!
//! - [`SyscallMessage`]: the `{ id, name?, args }` wire envelope
//! - [`WorkerMessage`]: what the kernel posts to a worker (init, completions)
//! - [`KernelPort`] / [`Inbox`]: the kernel's inbox channel
//! - [`WorkerPort`]: a task-bound sender handed to a worker

pub mod channel;
pub mod message;

pub use channel::{inbox, ChannelClosed, Inbox, InboxEvent, KernelPort, WorkerPort};
pub use message::{
    InitMessage, SchemaVersion, SyscallId, SyscallMessage, WorkerMessage, PROTOCOL_VERSION,
};
