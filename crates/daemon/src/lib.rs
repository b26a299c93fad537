//! The shmcache daemon
//!
//! [`Daemon::start`] brings up the shared regions, the cache index and the
//! worker pool in that order; [`Daemon::shutdown`] takes them down in reverse.

pub mod config;
pub mod lifecycle;
pub mod stats;
pub mod worker;

pub use config::{CliOverrides, ConfigSource, DaemonConfig, DaemonConfigLoader};
pub use lifecycle::{remove_stale_regions, Daemon};
pub use stats::{DaemonStats, StatsSnapshot};
pub use worker::{validate_worker_count, WorkerContext, WorkerPool};
