//! # Wire Contract Tests
//!
//! This crate provides "golden" tests for everything that crosses the
//! worker boundary, so the wire format does not drift accidentally.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: the expected JSON is written out literally
//! - **Testability first**: a changed field name or error number fails here
//!   before it breaks a worker
//!
//! ## Structure
//!
//! - [`syscalls`]: request envelopes, completions and error numbers
//! - [`worker_messages`]: what the kernel posts to workers
//! - [`config`]: the kernel configuration document

pub mod config;
pub mod syscalls;
pub mod worker_messages;

/// Common helpers for contract validation
pub mod test_helpers {
    use serde::Serialize;
    use serde_json::Value;

    /// Asserts that `value` serializes to exactly `expected`
    pub fn assert_wire<T: Serialize>(value: &T, expected: Value) {
        let actual = serde_json::to_value(value).unwrap_or(Value::Null);
        assert_eq!(
            actual, expected,
            "Wire format changed: expected {}, got {}",
            expected, actual
        );
    }

    /// Asserts that `raw` parses back into `expected`
    pub fn assert_parses<T>(raw: Value, expected: &T)
    where
        T: serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
    {
        let parsed: T = match serde_json::from_value(raw.clone()) {
            Ok(parsed) => parsed,
            Err(err) => panic!("{} no longer parses: {}", raw, err),
        };
        assert_eq!(&parsed, expected);
    }
}
