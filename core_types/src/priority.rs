//! Scheduling priority

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scheduling priority of a task
///
/// Lower values are scheduled sooner. Values are clamped to the nice range
/// `[-20, 19]`; scheduling is cooperative, so a better priority never
/// interrupts a task that is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i32);

impl Priority {
    pub const HIGHEST: Priority = Priority(-20);
    pub const LOWEST: Priority = Priority(19);
    pub const DEFAULT: Priority = Priority(0);

    /// Creates a priority, clamping out-of-range values
    pub fn new(raw: i32) -> Self {
        Self(raw.clamp(Self::HIGHEST.0, Self::LOWEST.0))
    }

    pub const fn get(self) -> i32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<i32> for Priority {
    fn from(raw: i32) -> Self {
        Self::new(raw)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
