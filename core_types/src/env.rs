//! Process environment and output stream identifiers

use crate::Fd;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Environment variables of a task (name → value, names unique)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Sets a variable, returning the previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Output stream of a task that a host can observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    /// The descriptor the stream is conventionally wired to
    pub fn fd(self) -> Fd {
        match self {
            OutputStream::Stdout => Fd::STDOUT,
            OutputStream::Stderr => Fd::STDERR,
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_keys_unique() {
        let mut env = Environment::new();
        assert_eq!(env.set("PATH", "/bin"), None);
        assert_eq!(env.set("PATH", "/usr/bin"), Some("/bin".to_string()));
        assert_eq!(env.len(), 1);
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
    }

    #[test]
    fn test_environment_serializes_as_map() {
        let env: Environment = [("HOME", "/"), ("USER", "panda")].into_iter().collect();
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, r#"{"HOME":"/","USER":"panda"}"#);
    }

    #[test]
    fn test_output_stream_fd() {
        assert_eq!(OutputStream::Stdout.fd(), Fd::STDOUT);
        assert_eq!(OutputStream::Stderr.fd(), Fd::STDERR);
    }
}
