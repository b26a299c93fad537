//! Shared utilities for shmcache
//!
//! Logging setup, RAII cleanup guards and the termination-signal listener
//! used by the daemon's lifecycle.

pub mod cleanup;
pub mod tracing;

pub use cleanup::*;
