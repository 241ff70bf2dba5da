//! Process lifecycle tracking

use core_types::Pid;
use serde::{Deserialize, Serialize};

/// Lifecycle of a command started by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// Spawned; its exit has not been observed yet
    Running,
    /// Exit observed and reported
    Exited { code: i32 },
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited { .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited { code } => Some(*code),
            ProcessState::Running => None,
        }
    }
}

/// Handle to a command started with `system`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: Pid,
    /// The command line as given
    pub command: String,
    pub state: ProcessState,
}

impl ProcessHandle {
    pub fn new(pid: Pid, command: impl Into<String>) -> Self {
        Self {
            pid,
            command: command.into(),
            state: ProcessState::Running,
        }
    }

    /// Records the exit; only the first code sticks
    pub fn mark_exited(&mut self, code: i32) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = ProcessState::Exited { code };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_states() {
        assert!(!ProcessState::Running.is_terminal());
        assert!(ProcessState::Exited { code: 0 }.is_terminal());
        assert_eq!(ProcessState::Exited { code: 3 }.exit_code(), Some(3));
        assert_eq!(ProcessState::Running.exit_code(), None);
    }

    #[test]
    fn test_first_exit_code_sticks() {
        let mut handle = ProcessHandle::new(Pid::first(), "true");
        assert_eq!(handle.state, ProcessState::Running);

        assert!(handle.mark_exited(1));
        assert!(!handle.mark_exited(2));
        assert_eq!(handle.state.exit_code(), Some(1));
    }
}
