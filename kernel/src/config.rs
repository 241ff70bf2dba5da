//! Kernel configuration

use crate::audit::DEFAULT_AUDIT_CAPACITY;
use core_types::Priority;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What to do with an envelope that fails validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedPolicy {
    /// Discard silently (logged and audited)
    #[default]
    Drop,
    /// Complete with `EPROTO` when the envelope carries a usable id
    Report,
}

/// Kernel configuration
///
/// Every field has a default, so a partial JSON document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Virtual CPU slots: tasks run per `step`
    pub n_cpus: usize,
    /// Log every syscall at info level
    pub debug: bool,
    pub malformed_envelopes: MalformedPolicy,
    /// Pending requests a task may have before new ones fail with `EAGAIN`
    pub max_pending_syscalls: usize,
    /// Upper bound on steps taken by `run_until_idle`
    pub max_iterations: usize,
    /// Priority of tasks created by the `spawn` syscall
    pub default_priority: Priority,
    /// Events each audit trail keeps before evicting the oldest
    pub audit_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            n_cpus: 1,
            debug: false,
            malformed_envelopes: MalformedPolicy::Drop,
            max_pending_syscalls: 256,
            max_iterations: 10_000,
            default_priority: Priority::DEFAULT,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse kernel config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid kernel config: {0}")]
    Invalid(String),
}

impl KernelConfig {
    /// Loads a configuration from a JSON document
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig = serde_json::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_cpus == 0 {
            return Err(ConfigError::Invalid("n_cpus must be at least 1".to_string()));
        }
        if self.max_pending_syscalls == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_syscalls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_n_cpus(mut self, n_cpus: usize) -> Self {
        self.n_cpus = n_cpus;
        self
    }

    pub fn with_malformed_envelopes(mut self, policy: MalformedPolicy) -> Self {
        self.malformed_envelopes = policy;
        self
    }

    pub fn with_max_pending_syscalls(mut self, limit: usize) -> Self {
        self.max_pending_syscalls = limit;
        self
    }

    pub fn with_audit_capacity(mut self, capacity: usize) -> Self {
        self.audit_capacity = capacity;
        self
    }
}
