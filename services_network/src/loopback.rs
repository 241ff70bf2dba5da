//! In-memory network stack.
//!
//! Listeners are plain endpoints; a connection to one echoes back whatever is
//! sent on it. Connecting to an endpoint nobody listens on is refused.

use crate::NetworkStack;
use kernel_api::{CapabilityError, Connection, Endpoint, Errno, IoCallback};
use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
pub struct LoopbackStack {
    listeners: RefCell<HashSet<Endpoint>>,
    attempts: Cell<usize>,
}

impl LoopbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, endpoint: Endpoint) {
        self.listeners.borrow_mut().insert(endpoint);
    }

    /// Number of connects that reached the stack
    pub fn connect_attempts(&self) -> usize {
        self.attempts.get()
    }
}

impl NetworkStack for LoopbackStack {
    fn connect(&self, endpoint: &Endpoint, cb: IoCallback<Box<dyn Connection>>) {
        self.attempts.set(self.attempts.get() + 1);
        if self.listeners.borrow().contains(endpoint) {
            cb(Ok(Box::new(EchoConnection::default())));
        } else {
            cb(Err(CapabilityError::new(
                Errno::ECONNREFUSED,
                format!("nothing listening on {}", endpoint),
            )));
        }
    }
}

#[derive(Debug, Default)]
struct EchoConnection {
    buffer: RefCell<VecDeque<u8>>,
    shut: Cell<bool>,
}

impl Connection for EchoConnection {
    fn send(&self, data: &[u8], cb: IoCallback<usize>) {
        if self.shut.get() {
            cb(Err(Errno::EPIPE.into()));
            return;
        }
        self.buffer.borrow_mut().extend(data.iter().copied());
        cb(Ok(data.len()))
    }

    fn recv(&self, len: usize, cb: IoCallback<Vec<u8>>) {
        let chunk: Vec<u8> = {
            let mut buffer = self.buffer.borrow_mut();
            let take = len.min(buffer.len());
            buffer.drain(..take).collect()
        };
        cb(Ok(chunk))
    }

    fn shutdown(&self) {
        self.shut.set(true);
    }
}
