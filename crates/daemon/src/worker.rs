//! Worker pool
//!
//! Each worker is a named thread that owns one data channel (worker `i`
//! writes channel `i`). It loops dequeue → lookup → transfer → mark_done and
//! exits when the queue reports shutdown. A failed request is recorded on
//! its slot; it never ends the worker.

use crate::stats::DaemonStats;
use shmcache_cache::{CacheEntry, CacheIndex};
use shmcache_core::{Error, Outcome, Result, MAX_WORKERS, MIN_WORKERS};
use shmcache_ipc::{ChannelWriter, DataChannels, RequestQueue, SlotRef, TransferReport};
use shmcache_utils::tracing::{request_completed, request_span};
use std::fs::File;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Check a requested worker count, `1..=MAX_WORKERS`
pub fn validate_worker_count(count: i64) -> Result<usize> {
    if count < MIN_WORKERS as i64 || count > MAX_WORKERS as i64 {
        return Err(Error::argument(format!(
            "worker count must be between {MIN_WORKERS} and {MAX_WORKERS}, got {count}"
        )));
    }
    Ok(count as usize)
}

/// Everything a worker needs, shared by all of them
#[derive(Debug)]
pub struct WorkerContext {
    pub queue: Arc<RequestQueue>,
    pub channels: Arc<DataChannels>,
    pub index: Arc<CacheIndex>,
    pub stats: Arc<DaemonStats>,
    pub transfer_timeout: Duration,
}

impl WorkerContext {
    /// Wake every worker and make `dequeue` return `None`
    pub fn begin_shutdown(&self) {
        self.queue.begin_shutdown();
        self.channels.begin_shutdown();
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers.
    ///
    /// If a thread cannot be spawned, the ones already running are stopped
    /// through the shared shutdown flags and joined before the error returns.
    pub fn spawn(count: usize, context: &Arc<WorkerContext>) -> Result<Self> {
        validate_worker_count(count as i64)?;
        let channels = context.channels.geometry().channels;
        if count > channels {
            return Err(Error::argument(format!(
                "{count} workers need {count} data channels, the region has {channels}"
            )));
        }

        let mut pool = Self {
            handles: Vec::with_capacity(count),
        };
        for worker in 0..count {
            let worker_context = Arc::clone(context);
            let spawned = thread::Builder::new()
                .name(format!("shmcache-worker-{worker}"))
                .spawn(move || run_worker(worker, &worker_context));
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    context.begin_shutdown();
                    pool.join();
                    return Err(Error::resource("worker thread", "spawn", e));
                }
            }
        }

        tracing::info!(workers = count, "worker pool started");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit; shutdown must have begun
    pub fn join(self) {
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                tracing::error!(worker = %name, "worker thread panicked");
            }
        }
        tracing::debug!("all workers joined");
    }
}

fn run_worker(worker: usize, context: &WorkerContext) {
    let mut writer = match context.channels.writer(worker, context.transfer_timeout) {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!(worker, error = %e, "worker has no data channel");
            return;
        }
    };
    tracing::debug!(worker, "worker started");

    loop {
        let claim = match context.queue.dequeue() {
            Ok(Some(claim)) => claim,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(worker, error = %e, "request queue is unusable, worker exiting");
                break;
            }
        };

        let span = request_span(worker, claim.id, &claim.path);
        let _entered = span.enter();

        let (outcome, report) = serve(worker, context, &mut writer, &claim);
        context.stats.record(outcome, report.bytes);
        request_completed(
            claim.id,
            &claim.path,
            &outcome.to_string(),
            report.bytes,
            report.chunks,
        );
        if let Err(e) = context.queue.mark_done(&claim, outcome, report.bytes) {
            tracing::warn!(error = %e, "could not record request outcome");
        }
    }

    tracing::debug!(worker, "worker stopped");
}

/// Resolve and stream one request; never fails, the outcome says how it went
fn serve(
    worker: usize,
    context: &WorkerContext,
    writer: &mut ChannelWriter<'_>,
    claim: &SlotRef,
) -> (Outcome, TransferReport) {
    let Some(entry) = context.index.lookup(&claim.path) else {
        return (Outcome::NotFound, TransferReport::default());
    };

    match transfer(worker, context, writer, claim, entry) {
        Ok(report) => (Outcome::Ok, report),
        Err(Error::Shutdown) => {
            tracing::debug!("transfer cut short by shutdown");
            (Outcome::Aborted, TransferReport::default())
        }
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "shared state failed during transfer");
            (Outcome::TransferFailed, TransferReport::default())
        }
        Err(e) => {
            tracing::warn!(error = %e, "transfer failed");
            (Outcome::TransferFailed, TransferReport::default())
        }
    }
}

fn transfer(
    worker: usize,
    context: &WorkerContext,
    writer: &mut ChannelWriter<'_>,
    claim: &SlotRef,
    entry: &CacheEntry,
) -> Result<TransferReport> {
    // Closed when this function returns, whatever the outcome.
    let file = File::open(&entry.disk_location).map_err(|e| Error::transfer_io(&claim.path, e))?;
    let size = file
        .metadata()
        .map_err(|e| Error::transfer_io(&claim.path, e))?
        .len();

    writer.begin(claim.id, size)?;
    if let Err(e) = context.queue.begin_transfer(claim, worker, size) {
        writer.abort();
        return Err(e);
    }
    writer.send_from(file, &claim.path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_bounds() {
        assert_eq!(validate_worker_count(1).unwrap(), 1);
        assert_eq!(validate_worker_count(3).unwrap(), 3);
        assert_eq!(validate_worker_count(128).unwrap(), 128);
        for bad in [0, -1, i64::MIN, 129] {
            assert!(
                matches!(validate_worker_count(bad), Err(Error::Argument { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
