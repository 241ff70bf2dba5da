//! Contract tests for messages posted to workers
