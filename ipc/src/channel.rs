//! Kernel inbox channel
//!
//! Every message that reaches the kernel travels through a single FIFO inbox:
//! syscall requests from workers, completions from handlers and output from
//! capture streams. The kernel drains it from its own step loop, so work
//! that finishes elsewhere (timers, external I/O, other threads) always
//! re-enters the single-threaded kernel before touching kernel state.

use crate::message::SyscallMessage;
use core_types::{OutputStream, Pid};
use serde_json::Value;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use thiserror::Error;

/// An event waiting in the kernel inbox
#[derive(Debug, Clone, PartialEq)]
pub enum InboxEvent {
    /// Raw message posted by a task's worker
    Request { pid: Pid, raw: Value },
    /// Completion produced by a syscall handler
    Completion { pid: Pid, message: SyscallMessage },
    /// Chunk written to a captured output stream
    Output {
        pid: Pid,
        stream: OutputStream,
        chunk: Vec<u8>,
    },
}

/// The kernel side of the channel has been dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("kernel inbox closed")]
pub struct ChannelClosed;

/// Sending half of the kernel inbox
#[derive(Debug, Clone)]
pub struct KernelPort {
    tx: Sender<InboxEvent>,
}

impl KernelPort {
    pub fn post(&self, event: InboxEvent) -> Result<(), ChannelClosed> {
        self.tx.send(event).map_err(|_| ChannelClosed)
    }

    pub fn post_completion(&self, pid: Pid, message: SyscallMessage) -> Result<(), ChannelClosed> {
        self.post(InboxEvent::Completion { pid, message })
    }

    pub fn post_output(
        &self,
        pid: Pid,
        stream: OutputStream,
        chunk: Vec<u8>,
    ) -> Result<(), ChannelClosed> {
        self.post(InboxEvent::Output { pid, stream, chunk })
    }

    /// Returns a port bound to one task, handed to that task's worker
    pub fn worker_port(&self, pid: Pid) -> WorkerPort {
        WorkerPort {
            pid,
            port: self.clone(),
        }
    }
}

/// The only way a worker can talk to the kernel
#[derive(Debug, Clone)]
pub struct WorkerPort {
    pid: Pid,
    port: KernelPort,
}

impl WorkerPort {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Posts a raw message; the kernel validates it when it drains the inbox
    pub fn post(&self, raw: Value) -> Result<(), ChannelClosed> {
        self.port.post(InboxEvent::Request { pid: self.pid, raw })
    }
}

/// Receiving half of the kernel inbox
#[derive(Debug)]
pub struct Inbox {
    rx: Receiver<InboxEvent>,
}

impl Inbox {
    /// Takes the next event without blocking
    pub fn try_next(&self) -> Option<InboxEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Takes every event currently queued, in arrival order
    pub fn drain(&self) -> Vec<InboxEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

/// Creates a connected inbox pair
pub fn inbox() -> (KernelPort, Inbox) {
    let (tx, rx) = mpsc::channel();
    (KernelPort { tx }, Inbox { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyscallId;
    use serde_json::json;

    #[test]
    fn test_inbox_preserves_order() {
        let (port, inbox) = inbox();
        let pid = Pid::first();

        port.post_output(pid, OutputStream::Stdout, b"a".to_vec())
            .unwrap();
        port.post_completion(pid, SyscallMessage::response(SyscallId::new(1), vec![]))
            .unwrap();

        let events = inbox.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], InboxEvent::Output { .. }));
        assert!(matches!(events[1], InboxEvent::Completion { .. }));
        assert!(inbox.try_next().is_none());
    }

    #[test]
    fn test_worker_port_tags_pid() {
        let (port, inbox) = inbox();
        let pid = Pid::first().next();
        let worker = port.worker_port(pid);

        worker.post(json!({ "id": 1 })).unwrap();

        match inbox.try_next() {
            Some(InboxEvent::Request { pid: from, raw }) => {
                assert_eq!(from, pid);
                assert_eq!(raw["id"], 1);
            }
            other => panic!("Expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_post_after_inbox_dropped() {
        let (port, inbox) = inbox();
        drop(inbox);
        assert_eq!(
            port.worker_port(Pid::first()).post(json!({})),
            Err(ChannelClosed)
        );
    }

    #[test]
    fn test_completions_from_other_threads() {
        let (port, inbox) = inbox();
        let handle = std::thread::spawn(move || {
            port.post_completion(Pid::first(), SyscallMessage::response(SyscallId::new(3), vec![]))
                .unwrap();
        });
        handle.join().unwrap();

        assert!(matches!(
            inbox.try_next(),
            Some(InboxEvent::Completion { .. })
        ));
    }
}
