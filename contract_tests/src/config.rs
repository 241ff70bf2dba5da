//! Contract tests for the kernel configuration document
