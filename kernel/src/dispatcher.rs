//! Syscall dispatch table
//!
//! Maps syscall names to handlers. A handler receives the decoded request
//! and the continuation; it may complete the continuation immediately, hand
//! it to a capability callback, or park it (as `wait4` does).

use crate::syscall::SyscallContext;
use crate::Kernel;
use kernel_api::SyscallRequest;
use std::collections::BTreeMap;

/// Handler entry point
pub type SyscallHandler = fn(&mut Kernel, SyscallContext, SyscallRequest);

#[derive(Default)]
pub struct Dispatcher {
    handlers: BTreeMap<&'static str, SyscallHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`, replacing any previous entry
    pub fn register(&mut self, name: &'static str, handler: SyscallHandler) -> Option<SyscallHandler> {
        self.handlers.insert(name, handler)
    }

    pub fn lookup(&self, name: &str) -> Option<SyscallHandler> {
        self.handlers.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_api::SYSCALL_NAMES;

    fn noop(_kernel: &mut Kernel, ctx: SyscallContext, _req: SyscallRequest) {
        ctx.ok()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut dispatcher = Dispatcher::new();
        assert!(dispatcher.is_empty());
        assert!(dispatcher.register("noop", noop).is_none());
        assert!(dispatcher.register("noop", noop).is_some());
        assert!(dispatcher.lookup("noop").is_some());
        assert!(dispatcher.lookup("missing").is_none());
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_default_table_covers_every_syscall() {
        let dispatcher = crate::handlers::default_dispatcher();
        for name in SYSCALL_NAMES {
            assert!(dispatcher.contains(name), "missing handler for {}", name);
        }
        assert_eq!(dispatcher.len(), SYSCALL_NAMES.len());
    }
}
