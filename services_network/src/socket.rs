//! Socket file capability.

use crate::BindingTable;
use core_types::KeepAlive;
use kernel_api::{Connection, Endpoint, Errno, File, FileKind, FileStat, IoCallback, Socket};
use std::cell::RefCell;
use std::rc::Rc;

/// A socket usable as a file once connected.
pub struct SocketFile {
    keep_alive: KeepAlive,
    connection: RefCell<Option<Box<dyn Connection>>>,
    binding: RefCell<Option<Endpoint>>,
    bindings: Rc<RefCell<BindingTable>>,
}

impl SocketFile {
    pub(crate) fn new(bindings: Rc<RefCell<BindingTable>>) -> Self {
        Self {
            keep_alive: KeepAlive::new(),
            connection: RefCell::new(None),
            binding: RefCell::new(None),
            bindings,
        }
    }
}

impl File for SocketFile {
    fn write(&self, data: &[u8], cb: IoCallback<usize>) {
        match self.connection.borrow().as_ref() {
            Some(connection) => connection.send(data, cb),
            None => cb(Err(Errno::ENOTCONN.into())),
        }
    }

    fn read(&self, len: usize, position: Option<u64>, cb: IoCallback<Vec<u8>>) {
        if position.is_some() {
            cb(Err(Errno::ESPIPE.into()));
            return;
        }
        match self.connection.borrow().as_ref() {
            Some(connection) => connection.recv(len, cb),
            None => cb(Err(Errno::ENOTCONN.into())),
        }
    }

    fn stat(&self, cb: IoCallback<FileStat>) {
        cb(Ok(FileStat::new(FileKind::Socket, 0, 0o600)))
    }

    fn keep_alive(&self) -> &KeepAlive {
        &self.keep_alive
    }

    fn close(&self) {
        if let Some(endpoint) = self.binding.borrow_mut().take() {
            self.bindings.borrow_mut().release(&endpoint);
            log::debug!("socket closed, released {}", endpoint);
        }
        if let Some(connection) = self.connection.borrow_mut().take() {
            connection.shutdown();
        }
    }

    fn as_socket(&self) -> Option<&dyn Socket> {
        Some(self)
    }
}

impl Socket for SocketFile {
    fn attach(&self, connection: Box<dyn Connection>) {
        *self.connection.borrow_mut() = Some(connection);
    }

    fn is_connected(&self) -> bool {
        self.connection.borrow().is_some()
    }

    fn binding(&self) -> Option<Endpoint> {
        self.binding.borrow().clone()
    }

    fn set_binding(&self, endpoint: Option<Endpoint>) {
        *self.binding.borrow_mut() = endpoint;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoopbackStack;
    use crate::NetworkStack;

    fn unconnected() -> SocketFile {
        SocketFile::new(Rc::new(RefCell::new(BindingTable::default())))
    }

    #[test]
    fn test_unconnected_socket_rejects_io() {
        let socket = unconnected();
        socket.write(b"x", Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::ENOTCONN)));
        socket.read(4, None, Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::ENOTCONN)));
        socket.stat(Box::new(|r| assert_eq!(r.unwrap().kind, FileKind::Socket)));
    }

    #[test]
    fn test_connected_socket_round_trips_data() {
        let stack = LoopbackStack::new();
        let endpoint = Endpoint::new("127.0.0.1", 7);
        stack.listen(endpoint.clone());

        let socket = Rc::new(unconnected());
        let target = Rc::clone(&socket);
        stack.connect(
            &endpoint,
            Box::new(move |r| target.attach(r.unwrap())),
        );
        assert!(socket.is_connected());

        socket.write(b"ping", Box::new(|r| assert_eq!(r.unwrap(), 4)));
        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        socket.read(16, None, Box::new(move |r| sink.borrow_mut().extend(r.unwrap())));
        assert_eq!(received.borrow().as_slice(), b"ping");
    }

    #[test]
    fn test_positioned_read_is_espipe() {
        let socket = unconnected();
        socket.read(1, Some(0), Box::new(|r| assert_eq!(r.unwrap_err().errno, Errno::ESPIPE)));
    }
}
