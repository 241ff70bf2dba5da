//! Syscall envelopes and continuations
//!
//! A worker posts `{ id, name, args }`. The kernel validates the envelope,
//! wraps the `(pid, id)` pair in a [`SyscallContext`] and hands the call to
//! the dispatcher. The context is the continuation: whoever holds it completes
//! the call, now or later, exactly once.

use crate::task::Task;
use core_types::Pid;
use ipc::{KernelPort, SyscallId, SyscallMessage};
use kernel_api::{CancelCheck, Errno};
use serde_json::{json, Value};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set once the owning task has exited
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Continuation for one pending syscall
///
/// `complete` consumes the context, so a context completes at most once.
/// Dropping a context without completing it leaves the call pending until
/// the task exits.
pub struct SyscallContext {
    pid: Pid,
    id: SyscallId,
    port: KernelPort,
    cancel: CancelToken,
}

impl SyscallContext {
    pub(crate) fn new(pid: Pid, id: SyscallId, port: KernelPort, cancel: CancelToken) -> Self {
        Self {
            pid,
            id,
            port,
            cancel,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn id(&self) -> SyscallId {
        self.id
    }

    /// True once the owning task has exited
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A check that capabilities parking this call can hold on to
    pub fn cancel_check(&self) -> CancelCheck {
        let cancel = self.cancel.clone();
        Rc::new(move || cancel.is_cancelled())
    }

    /// Sends `{ id, args }` back to the owning task
    pub fn complete(self, args: Vec<Value>) {
        if self.is_cancelled() {
            log::debug!("{} exited; dropping completion of {}", self.pid, self.id);
            return;
        }
        let message = SyscallMessage::response(self.id, args);
        if self.port.post_completion(self.pid, message).is_err() {
            log::warn!("kernel inbox closed; completion of {} lost", self.id);
        }
    }

    /// `[null]`
    pub fn ok(self) {
        self.complete(vec![Value::Null])
    }

    /// `[null, value]`
    pub fn succeed(self, value: Value) {
        self.complete(vec![Value::Null, value])
    }

    /// `[null, values...]`
    pub fn succeed_with(self, values: Vec<Value>) {
        let mut args = Vec::with_capacity(values.len() + 1);
        args.push(Value::Null);
        args.extend(values);
        self.complete(args)
    }

    /// `[-errno]`
    pub fn fail(self, errno: Errno) {
        self.complete(vec![json!(errno.wire_value())])
    }
}

impl fmt::Debug for SyscallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallContext")
            .field("pid", &self.pid)
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A validated envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: SyscallId,
    pub name: String,
    pub args: Vec<Value>,
}

/// Why an envelope failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEnvelope {
    /// The id, when it was present and well-typed
    pub id: Option<SyscallId>,
    pub reason: &'static str,
}

/// Validates `{ id: non-negative integer, name: string, args: array }`
pub fn parse_envelope(raw: &Value) -> Result<Envelope, MalformedEnvelope> {
    let Some(object) = raw.as_object() else {
        return Err(MalformedEnvelope {
            id: None,
            reason: "envelope is not an object",
        });
    };
    let id = object.get("id").and_then(Value::as_u64).map(SyscallId::new);
    let malformed = |reason| MalformedEnvelope { id, reason };

    let Some(id) = id else {
        return Err(malformed("missing or invalid id"));
    };
    let Some(name) = object.get("name").and_then(Value::as_str) else {
        return Err(malformed("missing or invalid name"));
    };
    let Some(args) = object.get("args").and_then(Value::as_array) else {
        return Err(malformed("missing or invalid args"));
    };

    Ok(Envelope {
        id,
        name: name.to_string(),
        args: args.clone(),
    })
}

/// A syscall bound to its continuation
#[derive(Debug)]
pub struct Syscall {
    pub ctx: SyscallContext,
    pub name: String,
    pub args: Vec<Value>,
}

impl Syscall {
    /// Parses a raw message from `task`'s worker
    ///
    /// Returns `None` when `id`, `name` or `args` is missing or ill-typed.
    pub fn parse(task: &Task, raw: &Value) -> Option<Syscall> {
        parse_envelope(raw)
            .ok()
            .map(|envelope| Syscall::from_envelope(task, envelope))
    }

    pub(crate) fn from_envelope(task: &Task, envelope: Envelope) -> Syscall {
        Syscall {
            ctx: SyscallContext::new(
                task.pid(),
                envelope.id,
                task.port().clone(),
                task.cancel_token(),
            ),
            name: envelope.name,
            args: envelope.args,
        }
    }

    /// The envelope this syscall was parsed from
    pub fn to_message(&self) -> SyscallMessage {
        SyscallMessage::request(self.ctx.id(), self.name.clone(), self.args.clone())
    }

    /// Splits the call into the continuation and the arguments a handler gets
    pub fn call_args(self) -> (SyscallContext, Vec<Value>) {
        (self.ctx, self.args)
    }
}
