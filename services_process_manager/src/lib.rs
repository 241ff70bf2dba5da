//! # Process Manager Service
//!
//! This crate runs commands on the kernel the way a host would: it resolves
//! a command line, spawns it with the requested stdio, streams captured
//! output to callbacks and reports the exit exactly once.
//!
//! ## Philosophy
//!
//! The manager never reaches into the kernel. It only uses [`KernelApi`]:
//! - `spawn` to start a command
//! - `step` / `drain_events` to observe output and exits
//! - `exit` to stop a command early
//!
//! [`KernelApi`]: kernel_api::KernelApi

pub mod command;
pub mod lifecycle;
pub mod manager;

pub use command::{resolve_command, CommandLine, BIN_DIR, SHELL_PATH};
pub use lifecycle::{ProcessHandle, ProcessState};
pub use manager::{ExitCallback, OutputCallback, ProcessManager, ProcessManagerError, SystemArgs};
