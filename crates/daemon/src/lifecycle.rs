//! Daemon startup and shutdown
//!
//! Startup order: validate the configuration, create the request region,
//! create the data region, build the cache index, spawn the workers. A
//! failure at any step releases everything created before it.
//!
//! Shutdown runs at most once, whether from [`Daemon::shutdown`] or from
//! `Drop`: raise both shared shutdown flags, join the workers, then destroy
//! the data region and the request region, in that order.

use crate::config::DaemonConfig;
use crate::stats::{DaemonStats, StatsSnapshot};
use crate::worker::{WorkerContext, WorkerPool};
use parking_lot::Mutex;
use shmcache_cache::CacheIndex;
use shmcache_core::Result;
use shmcache_ipc::{DataChannels, RegionNames, RequestQueue};
use shmcache_utils::SignalListener;
use std::sync::Arc;

/// A running daemon
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    names: RegionNames,
    stats: Arc<DaemonStats>,
    state: Mutex<State>,
}

/// Resources owned by the daemon, released in reverse order
#[derive(Debug, Default)]
struct State {
    queue: Option<Arc<RequestQueue>>,
    channels: Option<Arc<DataChannels>>,
    workers: Option<WorkerPool>,
    stopped: bool,
}

impl Daemon {
    /// Bring the daemon up
    pub fn start(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        let geometry = config.geometry()?;
        let names = config.region_names();

        let daemon = Self {
            names: names.clone(),
            stats: Arc::new(DaemonStats::default()),
            state: Mutex::new(State::default()),
            config,
        };
        tracing::debug!(
            config = %serde_json::to_string(&daemon.config).unwrap_or_default(),
            "starting daemon"
        );

        // Every early return below drops `daemon`, which releases whatever
        // the state holds at that point.
        let queue = Arc::new(RequestQueue::create(&names.requests, daemon.config.queue_slots)?);
        daemon.state.lock().queue = Some(Arc::clone(&queue));

        let channels = Arc::new(DataChannels::create(&names.data, geometry)?);
        daemon.state.lock().channels = Some(Arc::clone(&channels));

        let index = Arc::new(CacheIndex::init(&daemon.config.cache_dir)?);

        let context = Arc::new(WorkerContext {
            queue,
            channels,
            index,
            stats: Arc::clone(&daemon.stats),
            transfer_timeout: daemon.config.transfer_timeout(),
        });
        let workers = WorkerPool::spawn(daemon.config.workers, &context)?;
        drop(context);
        daemon.state.lock().workers = Some(workers);

        tracing::info!(
            requests = %names.requests,
            data = %names.data,
            workers = daemon.config.workers,
            "daemon ready"
        );
        Ok(daemon)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Names a proxy attaches to
    pub fn names(&self) -> &RegionNames {
        &self.names
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !self.state.lock().stopped
    }

    /// Block until SIGINT or SIGTERM, then shut down.
    ///
    /// Returns the signal number, or `None` if the listener was closed.
    pub fn run_until_signal(&self, listener: &mut SignalListener) -> Result<Option<i32>> {
        let signal = listener.wait();
        self.shutdown()?;
        Ok(signal)
    }

    /// Stop accepting requests, join the workers and release every region.
    ///
    /// Idempotent; in-flight transfers end as aborted.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.stopped {
            return Ok(());
        }
        state.stopped = true;
        tracing::info!("shutting down");

        if let Some(queue) = &state.queue {
            queue.begin_shutdown();
        }
        if let Some(channels) = &state.channels {
            channels.begin_shutdown();
        }
        if let Some(workers) = state.workers.take() {
            workers.join();
        }

        let mut first_error = None;
        if let Some(channels) = state.channels.take() {
            match Arc::try_unwrap(channels) {
                Ok(channels) => {
                    if let Err(e) = channels.destroy() {
                        first_error.get_or_insert(e);
                    }
                }
                Err(_) => tracing::warn!("data channels still referenced, unlinking without destroying primitives"),
            }
        }
        if let Some(queue) = state.queue.take() {
            match Arc::try_unwrap(queue) {
                Ok(queue) => {
                    if let Err(e) = queue.destroy() {
                        first_error.get_or_insert(e);
                    }
                }
                Err(_) => tracing::warn!("request queue still referenced, unlinking without destroying primitives"),
            }
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            served = stats.served,
            not_found = stats.not_found,
            failed = stats.failed,
            aborted = stats.aborted,
            bytes = stats.bytes,
            "daemon stopped"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "error while releasing daemon resources");
        }
    }
}

/// Remove region names left behind by a daemon that did not shut down.
///
/// Only safe when no daemon is running under `names`.
pub fn remove_stale_regions(names: &RegionNames) -> Result<()> {
    shmcache_ipc::shm::destroy(&names.requests)?;
    shmcache_ipc::shm::destroy(&names.data)?;
    tracing::info!(requests = %names.requests, data = %names.data, "removed stale regions");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmcache_core::Error;
    use tempfile::TempDir;

    fn isolated_config(cache_dir: &std::path::Path) -> DaemonConfig {
        DaemonConfig {
            cache_dir: cache_dir.to_path_buf(),
            workers: 2,
            queue_slots: 4,
            chunk_size: 1024,
            shm_prefix: Some(format!("shmcache-test-l-{}", uuid::Uuid::new_v4().simple())),
            ..Default::default()
        }
    }

    #[test]
    fn test_shutdown_is_idempotent() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::start(isolated_config(dir.path()))?;
        assert!(daemon.is_running());
        daemon.shutdown()?;
        daemon.shutdown()?;
        assert!(!daemon.is_running());
        Ok(())
    }

    #[test]
    fn test_invalid_config_fails_before_creating_regions() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig {
            workers: 0,
            ..isolated_config(dir.path())
        };
        let names = config.region_names();
        assert!(matches!(Daemon::start(config), Err(Error::Argument { .. })));
        assert!(shmcache_ipc::ShmRegion::attach(&names.requests).is_err());
    }

    #[test]
    fn test_failed_index_releases_regions() {
        let dir = TempDir::new().unwrap();
        let config = DaemonConfig {
            cache_dir: dir.path().join("missing"),
            ..isolated_config(dir.path())
        };
        let names = config.region_names();
        assert!(matches!(Daemon::start(config.clone()), Err(Error::FileSystem { .. })));
        assert!(shmcache_ipc::ShmRegion::attach(&names.requests).is_err());
        assert!(shmcache_ipc::ShmRegion::attach(&names.data).is_err());

        let config = DaemonConfig {
            cache_dir: dir.path().to_path_buf(),
            ..config
        };
        Daemon::start(config).unwrap();
    }

    #[test]
    fn test_second_daemon_on_same_names_is_refused() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = isolated_config(dir.path());
        let first = Daemon::start(config.clone())?;
        assert!(matches!(Daemon::start(config), Err(Error::Resource { .. })));
        assert!(first.is_running());
        assert!(shmcache_ipc::ShmRegion::attach(&first.names().requests).is_ok());
        Ok(())
    }

    #[test]
    fn test_remove_stale_regions() -> Result<()> {
        let names = RegionNames::with_prefix(&format!(
            "shmcache-test-l-{}",
            uuid::Uuid::new_v4().simple()
        ));
        shmcache_ipc::ShmRegion::create(&names.requests, 64)?.detach();
        remove_stale_regions(&names)?;
        assert!(shmcache_ipc::ShmRegion::attach(&names.requests).is_err());
        Ok(())
    }
}
