//! Syscall audit trail
//!
//! Records what happened to every message that reached the kernel, so tests
//! can verify protocol behavior without scraping logs. Trails are bounded:
//! once full, the oldest events are evicted.

use core_types::Pid;
use ipc::SyscallId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Events an audit trail keeps unless configured otherwise
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

/// Fixed-capacity event buffer
#[derive(Debug, Clone)]
pub struct AuditRing<T> {
    events: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> AuditRing<T> {
    /// A ring holding at most `capacity` events; zero records nothing
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(DEFAULT_AUDIT_CAPACITY)),
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, event: T) {
        if self.capacity == 0 {
            self.evicted += 1;
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.evicted += 1;
        }
        self.events.push_back(event);
    }

    /// Changes the capacity, evicting the oldest events that no longer fit
    pub fn set_capacity(&mut self, capacity: usize) {
        while self.events.len() > capacity {
            self.events.pop_front();
            self.evicted += 1;
        }
        self.capacity = capacity;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn events(&self) -> &VecDeque<T> {
        &self.events
    }

    /// Events dropped to stay within capacity
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl<T> Default for AuditRing<T> {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

/// Syscall audit event (for testing and verification).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyscallEvent {
    /// A well-formed request was handed to the dispatcher
    Invoked {
        pid: Pid,
        id: SyscallId,
        name: String,
    },
    /// A completion was routed to its pending call
    Completed { pid: Pid, id: SyscallId },
    /// The request was answered with an error before reaching a handler
    Rejected {
        pid: Pid,
        id: SyscallId,
        name: String,
        reason: String,
    },
    /// A request was ignored entirely
    Dropped { pid: Pid, reason: String },
    /// A completion arrived for a call that is no longer pending
    Discarded { pid: Pid, id: SyscallId },
}

impl SyscallEvent {
    pub fn pid(&self) -> Pid {
        match self {
            SyscallEvent::Invoked { pid, .. }
            | SyscallEvent::Completed { pid, .. }
            | SyscallEvent::Rejected { pid, .. }
            | SyscallEvent::Dropped { pid, .. }
            | SyscallEvent::Discarded { pid, .. } => *pid,
        }
    }
}

/// Audit log for syscall operations.
#[derive(Debug, Clone, Default)]
pub struct SyscallAuditLog {
    events: AuditRing<SyscallEvent>,
}

impl SyscallAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: AuditRing::new(capacity),
        }
    }

    pub fn record(&mut self, event: SyscallEvent) {
        self.events.push(event);
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.events.set_capacity(capacity);
    }

    /// Retained events, oldest first
    pub fn events(&self) -> &VecDeque<SyscallEvent> {
        self.events.events()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events evicted to stay within capacity
    pub fn evicted(&self) -> u64 {
        self.events.evicted()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events().iter().any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SyscallEvent) -> bool,
    {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_log_queries() {
        let mut log = SyscallAuditLog::new();
        let pid = Pid::first();
        log.record(SyscallEvent::Invoked {
            pid,
            id: SyscallId::new(1),
            name: "getpid".to_string(),
        });
        log.record(SyscallEvent::Completed {
            pid,
            id: SyscallId::new(1),
        });
        log.record(SyscallEvent::Discarded {
            pid,
            id: SyscallId::new(1),
        });

        assert_eq!(log.events().len(), 3);
        assert!(log.has_event(|e| matches!(e, SyscallEvent::Completed { .. })));
        assert_eq!(
            log.count_events(|e| matches!(e, SyscallEvent::Discarded { .. })),
            1
        );
        assert!(log.events().iter().all(|e| e.pid() == pid));

        log.clear();
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = AuditRing::new(3);
        for n in 0..5 {
            ring.push(n);
        }
        assert_eq!(ring.events().iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.evicted(), 2);

        ring.set_capacity(1);
        assert_eq!(ring.events().iter().copied().collect::<Vec<_>>(), vec![4]);
        assert_eq!(ring.evicted(), 4);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut log = SyscallAuditLog::with_capacity(0);
        log.record(SyscallEvent::Dropped {
            pid: Pid::first(),
            reason: "noise".to_string(),
        });
        assert!(log.is_empty());
        assert_eq!(log.evicted(), 1);
    }
}
