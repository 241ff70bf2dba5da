//! Networking service.
//!
//! Brokers connect, bind and unbind for socket capabilities with explicit
//! policy checks. Everything below connect (routing, transport, framing) is
//! the job of a [`NetworkStack`] implementation.

pub mod loopback;
pub mod socket;

pub use loopback::LoopbackStack;
pub use socket::SocketFile;

use kernel_api::{
    CapabilityError, ConnectCallback, Connection, Endpoint, Errno, FileHandle, IoCallback,
    KernelError,
};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use thiserror::Error;

/// Socket operation being evaluated by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketOperation {
    Connect,
    Bind,
}

/// Context used for network policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketContext {
    pub operation: SocketOperation,
    pub endpoint: Endpoint,
}

/// Policy decision for network operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkDecision {
    Allow,
    Deny { reason: String },
}

/// Network policy trait.
pub trait NetworkPolicy {
    fn evaluate(&self, context: &SocketContext) -> NetworkDecision;
}

/// Allow-all network policy.
pub struct AllowAllPolicy;

impl NetworkPolicy for AllowAllPolicy {
    fn evaluate(&self, _context: &SocketContext) -> NetworkDecision {
        NetworkDecision::Allow
    }
}

/// Deny-all network policy.
pub struct DenyAllPolicy;

impl NetworkPolicy for DenyAllPolicy {
    fn evaluate(&self, _context: &SocketContext) -> NetworkDecision {
        NetworkDecision::Deny {
            reason: "All network traffic denied".to_string(),
        }
    }
}

/// The transport below connect.
pub trait NetworkStack {
    /// Opens a connection to `endpoint`; `cb` fires exactly once.
    fn connect(&self, endpoint: &Endpoint, cb: IoCallback<Box<dyn Connection>>);
}

/// Network service errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("Policy denied {operation:?} to {endpoint}: {reason}")]
    PolicyDenied {
        operation: SocketOperation,
        endpoint: Endpoint,
        reason: String,
    },

    #[error("File is not a socket")]
    NotASocket,

    #[error("Address in use: {0}")]
    AddressInUse(Endpoint),

    #[error("Socket is already bound")]
    AlreadyBound,

    #[error("Socket is not bound to {0}")]
    NotBound(Endpoint),

    #[error("Socket is already connected")]
    AlreadyConnected,

    #[error("Connect failed: {0}")]
    ConnectFailed(CapabilityError),
}

impl NetworkError {
    pub fn errno(&self) -> Errno {
        match self {
            NetworkError::PolicyDenied {
                operation: SocketOperation::Connect,
                ..
            } => Errno::ECONNREFUSED,
            NetworkError::PolicyDenied {
                operation: SocketOperation::Bind,
                ..
            } => Errno::EACCES,
            NetworkError::NotASocket => Errno::ENOTSOCK,
            NetworkError::AddressInUse(_) => Errno::EADDRINUSE,
            NetworkError::AlreadyBound | NetworkError::NotBound(_) => Errno::EINVAL,
            NetworkError::AlreadyConnected => Errno::EISCONN,
            NetworkError::ConnectFailed(err) => err.errno,
        }
    }
}

impl From<NetworkError> for KernelError {
    fn from(error: NetworkError) -> Self {
        match error {
            NetworkError::ConnectFailed(err) => KernelError::Capability(err),
            other => KernelError::Capability(CapabilityError::new(other.errno(), other.to_string())),
        }
    }
}

/// Endpoints currently held by bound sockets.
#[derive(Debug, Default)]
pub(crate) struct BindingTable {
    bound: HashSet<Endpoint>,
}

impl BindingTable {
    pub(crate) fn release(&mut self, endpoint: &Endpoint) -> bool {
        self.bound.remove(endpoint)
    }
}

/// Network service implementing connect/bind/unbind with policy.
pub struct NetworkService {
    policy: Box<dyn NetworkPolicy>,
    stack: Rc<dyn NetworkStack>,
    bindings: Rc<RefCell<BindingTable>>,
}

impl NetworkService {
    pub fn new(policy: Box<dyn NetworkPolicy>, stack: Rc<dyn NetworkStack>) -> Self {
        Self {
            policy,
            stack,
            bindings: Rc::new(RefCell::new(BindingTable::default())),
        }
    }

    /// Creates an unconnected, unbound socket capability.
    pub fn socket(&self) -> FileHandle {
        Rc::new(SocketFile::new(Rc::clone(&self.bindings)))
    }

    fn check(&self, operation: SocketOperation, endpoint: &Endpoint) -> Result<(), NetworkError> {
        let context = SocketContext {
            operation,
            endpoint: endpoint.clone(),
        };
        match self.policy.evaluate(&context) {
            NetworkDecision::Allow => Ok(()),
            NetworkDecision::Deny { reason } => Err(NetworkError::PolicyDenied {
                operation,
                endpoint: endpoint.clone(),
                reason,
            }),
        }
    }

    /// Connects `file` to `endpoint`.
    ///
    /// `cb` fires exactly once. On success the connection is attached and the
    /// socket becomes usable for I/O; on failure it stays unconnected.
    pub fn connect(&self, file: &FileHandle, endpoint: Endpoint, cb: ConnectCallback) {
        let precheck = match file.as_socket() {
            None => Err(NetworkError::NotASocket),
            Some(socket) if socket.is_connected() => Err(NetworkError::AlreadyConnected),
            Some(_) => self.check(SocketOperation::Connect, &endpoint),
        };
        if let Err(err) = precheck {
            log::debug!("connect to {} rejected: {}", endpoint, err);
            cb(Err(err.into()));
            return;
        }

        let file = Rc::clone(file);
        let target = endpoint.clone();
        self.stack.connect(
            &endpoint,
            Box::new(move |result| match result {
                Ok(connection) => match file.as_socket() {
                    Some(socket) => {
                        socket.attach(connection);
                        log::debug!("connected to {}", target);
                        cb(Ok(()));
                    }
                    None => cb(Err(NetworkError::NotASocket.into())),
                },
                Err(err) => {
                    log::debug!("connect to {} failed: {}", target, err);
                    cb(Err(NetworkError::ConnectFailed(err).into()));
                }
            }),
        );
    }

    /// Binds `file` to `endpoint`.
    pub fn bind(&self, file: &FileHandle, endpoint: Endpoint) -> Result<(), NetworkError> {
        let socket = file.as_socket().ok_or(NetworkError::NotASocket)?;
        if socket.binding().is_some() {
            return Err(NetworkError::AlreadyBound);
        }
        self.check(SocketOperation::Bind, &endpoint)?;

        let mut bindings = self.bindings.borrow_mut();
        if !bindings.bound.insert(endpoint.clone()) {
            return Err(NetworkError::AddressInUse(endpoint));
        }
        socket.set_binding(Some(endpoint));
        Ok(())
    }

    /// Releases the binding `file` holds on `endpoint`.
    pub fn unbind(&self, file: &FileHandle, endpoint: &Endpoint) -> Result<(), NetworkError> {
        let socket = file.as_socket().ok_or(NetworkError::NotASocket)?;
        if socket.binding().as_ref() != Some(endpoint) {
            return Err(NetworkError::NotBound(endpoint.clone()));
        }
        self.bindings.borrow_mut().release(endpoint);
        socket.set_binding(None);
        Ok(())
    }

    pub fn is_bound(&self, endpoint: &Endpoint) -> bool {
        self.bindings.borrow().bound.contains(endpoint)
    }
}
