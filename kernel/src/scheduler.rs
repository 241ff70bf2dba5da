//! Priority scheduler
//!
//! ## Philosophy
//!
//! - **Cooperative**: a task runs until it blocks on its next syscall; a
//!   better priority never interrupts a running task.
//! - **Determinism first**: same arrivals + same priorities => same schedule.
//!
//! ## Design
//!
//! - **Priority order**: lower priority values run first.
//! - **FIFO within a priority**: ties are broken by arrival sequence.
//! - **Stable position**: changing a task's priority moves it to its new
//!   level but keeps its arrival sequence.

use crate::audit::AuditRing;
use core_types::{Pid, Priority};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Scheduling event for audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    /// Task was selected to run
    TaskSelected { pid: Pid, step: u64 },
    /// Task exited and left the scheduler
    TaskExited { pid: Pid, code: i32, step: u64 },
    /// Task priority changed
    PriorityChanged {
        pid: Pid,
        old: Priority,
        new: Priority,
    },
    /// `exit` was called again for a task that already exited
    ExitIgnored { pid: Pid, code: i32 },
}

/// Sort key of a queued task
type QueueKey = (Priority, u64);

/// Run queue ordered by (priority, arrival)
#[derive(Debug, Default)]
struct RunQueue {
    queue: BTreeMap<QueueKey, Pid>,
    index: HashMap<Pid, QueueKey>,
    next_seq: u64,
}

impl RunQueue {
    fn enqueue(&mut self, pid: Pid, priority: Priority) -> bool {
        if self.index.contains_key(&pid) {
            return false;
        }
        let key = (priority, self.next_seq);
        self.next_seq += 1;
        self.queue.insert(key, pid);
        self.index.insert(pid, key);
        true
    }

    fn dequeue(&mut self) -> Option<Pid> {
        let (_, pid) = self.queue.pop_first()?;
        self.index.remove(&pid);
        Some(pid)
    }

    fn remove(&mut self, pid: Pid) {
        if let Some(key) = self.index.remove(&pid) {
            self.queue.remove(&key);
        }
    }

    fn reposition(&mut self, pid: Pid, priority: Priority) {
        if let Some(key) = self.index.get_mut(&pid) {
            if let Some(pid) = self.queue.remove(&*key) {
                let new_key = (priority, key.1);
                self.queue.insert(new_key, pid);
                *key = new_key;
            }
        }
    }

    fn contains(&self, pid: Pid) -> bool {
        self.index.contains_key(&pid)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn order(&self) -> Vec<Pid> {
        self.queue.values().copied().collect()
    }
}

/// Priority scheduler
pub struct Scheduler {
    run_queue: RunQueue,
    priorities: HashMap<Pid, Priority>,
    step: u64,
    /// Bounded audit trail of scheduling events
    audit_log: AuditRing<ScheduleEvent>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            run_queue: RunQueue::default(),
            priorities: HashMap::new(),
            step: 0,
            audit_log: AuditRing::default(),
        }
    }

    /// Starts tracking a task; it is not queued until `enqueue`
    pub fn register(&mut self, pid: Pid, priority: Priority) {
        self.priorities.insert(pid, priority);
    }

    /// Queues a task unless it is already queued; returns whether it was added
    pub fn enqueue(&mut self, pid: Pid) -> bool {
        match self.priorities.get(&pid) {
            Some(priority) => self.run_queue.enqueue(pid, *priority),
            None => false,
        }
    }

    /// Dequeues the next task to run
    pub fn dequeue_next(&mut self) -> Option<Pid> {
        let pid = self.run_queue.dequeue()?;
        self.audit_log.push(ScheduleEvent::TaskSelected {
            pid,
            step: self.step,
        });
        Some(pid)
    }

    /// Forgets a task that exited
    pub fn remove(&mut self, pid: Pid, code: i32) {
        self.run_queue.remove(pid);
        if self.priorities.remove(&pid).is_some() {
            self.audit_log.push(ScheduleEvent::TaskExited {
                pid,
                code,
                step: self.step,
            });
        }
    }

    /// Changes a task's priority and repositions it; returns the old priority
    pub fn set_priority(&mut self, pid: Pid, priority: Priority) -> Option<Priority> {
        let slot = self.priorities.get_mut(&pid)?;
        let old = std::mem::replace(slot, priority);
        self.run_queue.reposition(pid, priority);
        self.audit_log.push(ScheduleEvent::PriorityChanged {
            pid,
            old,
            new: priority,
        });
        Some(old)
    }

    pub fn priority(&self, pid: Pid) -> Option<Priority> {
        self.priorities.get(&pid).copied()
    }

    pub fn is_queued(&self, pid: Pid) -> bool {
        self.run_queue.contains(pid)
    }

    pub fn runnable_count(&self) -> usize {
        self.run_queue.len()
    }

    /// Queued tasks in the order they would run
    pub fn run_order(&self) -> Vec<Pid> {
        self.run_queue.order()
    }

    pub(crate) fn advance_step(&mut self) {
        self.step += 1;
    }

    pub(crate) fn record(&mut self, event: ScheduleEvent) {
        self.audit_log.push(event);
    }

    pub fn current_step(&self) -> u64 {
        self.step
    }

    /// Retained scheduling events, oldest first
    pub fn audit_log(&self) -> &VecDeque<ScheduleEvent> {
        self.audit_log.events()
    }

    pub(crate) fn set_audit_capacity(&mut self, capacity: usize) {
        self.audit_log.set_capacity(capacity);
    }

    /// Clears the audit log
    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
