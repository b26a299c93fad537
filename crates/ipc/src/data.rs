//! Chunked data transfer channels
//!
//! The data region is split into one channel per worker. Each channel is a
//! ring buffer with its own mutex and two condition variables, carrying one
//! transfer at a time from a worker ([`ChannelWriter`]) to the proxy
//! ([`ChannelReader`]).
//!
//! `written` and `read` are absolute byte offsets into the current transfer;
//! the ring position of an offset is `offset % capacity`. The writer may run
//! at most `capacity` bytes ahead of the reader, so bytes are delivered in
//! exactly the order they were written.

use crate::layout::{align_up, CACHE_LINE};
use crate::shm::ShmRegion;
use crate::sync::{deadline_after, SharedCondvar, SharedMutex, SharedMutexGuard};
use shmcache_core::{
    Error, Result, DATA_REGION_MAGIC, MAX_CHANNEL_CAPACITY, MAX_CHUNK_SIZE, MAX_WORKERS,
    MIN_CHUNK_SIZE, MIN_WORKERS,
};
use std::cell::UnsafeCell;
use std::io::{Read, Write};
use std::mem::size_of;
use std::ptr::{self, addr_of_mut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[repr(C)]
struct DataHeader {
    magic: AtomicU64,
    channels: u32,
    _reserved: u32,
    chunk_size: u64,
    capacity: u64,
    stride: u64,
    shutdown: AtomicU32,
}

#[repr(C)]
struct ChannelHeader {
    lock: SharedMutex,
    space_available: SharedCondvar,
    data_available: SharedCondvar,
    state: UnsafeCell<TransferState>,
}

#[repr(C)]
struct TransferState {
    transfer_id: u64,
    total: u64,
    written: u64,
    read: u64,
    chunks: u64,
    phase: u32,
    /// The reader has observed the end of a complete transfer
    end_seen: u32,
}

impl TransferState {
    fn phase(&self) -> Phase {
        match self.phase {
            1 => Phase::Streaming,
            2 => Phase::Complete,
            3 => Phase::Aborted,
            _ => Phase::Idle,
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase as u32;
    }

    /// Nothing of the current transfer is left for a reader
    fn is_drained(&self) -> bool {
        match self.phase() {
            Phase::Idle | Phase::Aborted => true,
            Phase::Complete => self.end_seen != 0,
            Phase::Streaming => false,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle = 0,
    Streaming = 1,
    Complete = 2,
    Aborted = 3,
}

const HEADER_SPAN: usize = align_up(size_of::<DataHeader>(), CACHE_LINE);
const RING_OFFSET: usize = align_up(size_of::<ChannelHeader>(), CACHE_LINE);

/// Shape of the data region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataGeometry {
    /// Number of channels, one per worker
    pub channels: usize,
    /// Largest number of bytes moved per chunk
    pub chunk_size: usize,
    /// Ring bytes per channel, a multiple of `chunk_size`
    pub capacity: usize,
}

impl DataGeometry {
    /// Geometry with a one-chunk ring per channel
    pub fn new(channels: usize, chunk_size: usize) -> Result<Self> {
        Self::with_capacity(channels, chunk_size, chunk_size)
    }

    pub fn with_capacity(channels: usize, chunk_size: usize, capacity: usize) -> Result<Self> {
        let geometry = Self {
            channels,
            chunk_size,
            capacity,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.channels) {
            return Err(Error::argument(format!(
                "data channels must be between {MIN_WORKERS} and {MAX_WORKERS}, got {}",
                self.channels
            )));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::argument(format!(
                "chunk size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            )));
        }
        if self.capacity == 0 || self.capacity % self.chunk_size != 0 {
            return Err(Error::argument(format!(
                "channel capacity {} is not a positive multiple of the chunk size {}",
                self.capacity, self.chunk_size
            )));
        }
        if self.capacity > MAX_CHANNEL_CAPACITY {
            return Err(Error::argument(format!(
                "channel capacity {} exceeds {MAX_CHANNEL_CAPACITY} bytes",
                self.capacity
            )));
        }
        self.region_size().map(|_| ())
    }

    /// Channel stride and region size, `None` if either overflows
    fn layout(&self) -> Option<(usize, usize)> {
        let stride = RING_OFFSET
            .checked_add(self.capacity)?
            .checked_next_multiple_of(CACHE_LINE)?;
        let size = self.channels.checked_mul(stride)?.checked_add(HEADER_SPAN)?;
        Some((stride, size))
    }

    fn stride(&self) -> Result<usize> {
        self.layout().map(|(stride, _)| stride).ok_or_else(|| self.too_large())
    }

    /// Bytes needed for the whole region
    pub fn region_size(&self) -> Result<usize> {
        self.layout().map(|(_, size)| size).ok_or_else(|| self.too_large())
    }

    fn too_large(&self) -> Error {
        Error::argument(format!(
            "{} channels of {} bytes do not fit in the address space",
            self.channels, self.capacity
        ))
    }
}

/// Bytes and chunks moved by one transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes: u64,
    pub chunks: u64,
}

/// The data region, as seen by either process
pub struct DataChannels {
    region: ShmRegion,
    geometry: DataGeometry,
    stride: usize,
}

/// One channel with its mutex held
struct ChannelGuard<'a> {
    channel: &'a ChannelHeader,
    ring: *mut u8,
    capacity: usize,
    region: &'a str,
    guard: SharedMutexGuard<'a>,
}

impl ChannelGuard<'_> {
    fn state(&mut self) -> &mut TransferState {
        // SAFETY: the channel mutex is held, which `self.guard` proves.
        unsafe { &mut *self.channel.state.get() }
    }

    fn wait_for_space(&self, deadline: Option<Instant>) -> Result<bool> {
        self.channel
            .space_available
            .wait(&self.guard, deadline)
            .map_err(|e| Error::resource(self.region, "pthread_cond_wait", e))
    }

    fn wait_for_data(&self, deadline: Option<Instant>) -> Result<bool> {
        self.channel
            .data_available
            .wait(&self.guard, deadline)
            .map_err(|e| Error::resource(self.region, "pthread_cond_wait", e))
    }

    fn wake_all(&self) {
        self.channel.space_available.broadcast();
        self.channel.data_available.broadcast();
    }

    fn write_ring(&mut self, offset: u64, bytes: &[u8]) {
        let start = (offset % self.capacity as u64) as usize;
        let first = bytes.len().min(self.capacity - start);
        // SAFETY: `bytes.len() <= capacity` is checked by the writer, the ring
        // spans `capacity` bytes and the lock is held.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.ring.add(start), first);
            ptr::copy_nonoverlapping(bytes[first..].as_ptr(), self.ring, bytes.len() - first);
        }
    }

    fn read_ring(&mut self, offset: u64, out: &mut [u8]) {
        let start = (offset % self.capacity as u64) as usize;
        let first = out.len().min(self.capacity - start);
        // SAFETY: as for `write_ring`; `out.len()` never exceeds the bytes
        // available, which never exceeds `capacity`.
        unsafe {
            ptr::copy_nonoverlapping(self.ring.add(start), out.as_mut_ptr(), first);
            ptr::copy_nonoverlapping(self.ring, out[first..].as_mut_ptr(), out.len() - first);
        }
    }
}

impl DataChannels {
    /// Create the data region and initialize every channel
    pub fn create(name: &str, geometry: DataGeometry) -> Result<Self> {
        geometry.validate()?;
        let stride = geometry.stride()?;
        let region = ShmRegion::create(name, geometry.region_size()?)?;

        let header = region.base().as_ptr().cast::<DataHeader>();
        // SAFETY: fresh zero-filled region of `region_size` bytes, unpublished.
        unsafe {
            addr_of_mut!((*header).channels).write(geometry.channels as u32);
            addr_of_mut!((*header).chunk_size).write(geometry.chunk_size as u64);
            addr_of_mut!((*header).capacity).write(geometry.capacity as u64);
            addr_of_mut!((*header).stride).write(stride as u64);
        }

        let channels = Self {
            region,
            geometry,
            stride,
        };
        for index in 0..geometry.channels {
            // SAFETY: the channel lies inside the unpublished region.
            if let Err(e) = unsafe { init_channel(channels.channel_ptr(index)) } {
                for initialized in 0..index {
                    // SAFETY: initialized above and never shared.
                    unsafe { destroy_channel(&*channels.channel_ptr(initialized)) };
                }
                return Err(Error::resource(name, "pthread init", e));
            }
        }
        channels.header().magic.store(DATA_REGION_MAGIC, Ordering::Release);

        tracing::info!(
            region = %name,
            channels = geometry.channels,
            chunk_size = geometry.chunk_size,
            capacity = geometry.capacity,
            "data channels created"
        );
        Ok(channels)
    }

    /// Attach to the data region the daemon has published
    pub fn attach(name: &str) -> Result<Self> {
        let region = ShmRegion::attach(name)?;
        if region.len() < HEADER_SPAN {
            return Err(Error::protocol(format!(
                "region '{name}' is too small for data channels"
            )));
        }
        // SAFETY: the mapping covers at least one header.
        let header = unsafe { &*region.base().as_ptr().cast::<DataHeader>() };
        if header.magic.load(Ordering::Acquire) != DATA_REGION_MAGIC {
            return Err(Error::protocol(format!(
                "region '{name}' is not initialized data channels"
            )));
        }
        let geometry = DataGeometry {
            channels: header.channels as usize,
            chunk_size: header.chunk_size as usize,
            capacity: header.capacity as usize,
        };
        let (stride, size) = geometry
            .validate()
            .and_then(|()| Ok((geometry.stride()?, geometry.region_size()?)))
            .map_err(|e| Error::protocol(format!("data region '{name}': {e}")))?;
        if header.stride as usize != stride || region.len() < size {
            return Err(Error::protocol(format!(
                "data region '{name}' has an incompatible layout"
            )));
        }
        Ok(Self {
            region,
            geometry,
            stride,
        })
    }

    /// Destroy every channel's primitives and unlink the region.
    ///
    /// Only the creating process may call this, after [`begin_shutdown`]
    /// and after every local writer and reader is gone.
    ///
    /// [`begin_shutdown`]: Self::begin_shutdown
    pub fn destroy(self) -> Result<()> {
        if !self.region.is_owner() {
            return Err(Error::protocol("only the creating process may destroy data channels"));
        }
        self.header().magic.store(0, Ordering::Release);
        for index in 0..self.geometry.channels {
            // SAFETY: shutdown was broadcast and all local users are gone.
            unsafe { destroy_channel(&*self.channel_ptr(index)) };
        }
        tracing::debug!(region = %self.region.name(), "data channel primitives destroyed");
        self.region.destroy()
    }

    /// Unmap the region without touching its state
    pub fn detach(self) {
        self.region.detach();
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn geometry(&self) -> DataGeometry {
        self.geometry
    }

    pub fn is_shutting_down(&self) -> bool {
        self.header().shutdown.load(Ordering::Acquire) != 0
    }

    /// Set the shared shutdown flag and wake everyone blocked on any channel
    pub fn begin_shutdown(&self) {
        self.header().shutdown.store(1, Ordering::Release);
        for index in 0..self.geometry.channels {
            match self.lock(index) {
                Ok(channel) => channel.wake_all(),
                Err(e) => {
                    tracing::warn!(channel = index, error = %e, "could not lock channel for shutdown");
                }
            }
        }
    }

    /// Writing end of channel `index`; every wait is bounded by `timeout`
    pub fn writer(&self, index: usize, timeout: Duration) -> Result<ChannelWriter<'_>> {
        self.check_index(index)?;
        Ok(ChannelWriter {
            channels: self,
            index,
            timeout,
            active: None,
        })
    }

    /// Reading end of transfer `transfer_id` on channel `index`
    pub fn reader(
        &self,
        index: usize,
        transfer_id: u64,
        timeout: Option<Duration>,
    ) -> Result<ChannelReader<'_>> {
        self.check_index(index)?;
        let mut channel = self.lock(index)?;
        let state = channel.state();
        if state.transfer_id != transfer_id || state.phase() == Phase::Idle {
            return Err(Error::protocol(format!(
                "channel {index} does not carry transfer {transfer_id}"
            )));
        }
        let total = state.total;
        Ok(ChannelReader {
            channels: self,
            index,
            transfer_id,
            total,
            timeout,
            done: false,
        })
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.geometry.channels {
            return Err(Error::argument(format!(
                "channel {index} out of range, region has {}",
                self.geometry.channels
            )));
        }
        Ok(())
    }

    fn lock(&self, index: usize) -> Result<ChannelGuard<'_>> {
        let ptr = self.channel_ptr(index);
        // SAFETY: the channel was initialized before the region was
        // published and lives as long as the mapping.
        let channel = unsafe { &*ptr };
        let guard = channel
            .lock
            .lock()
            .map_err(|e| Error::resource(self.region.name(), "pthread_mutex_lock", e))?;
        Ok(ChannelGuard {
            channel,
            // SAFETY: the ring follows the channel header inside its stride.
            ring: unsafe { ptr.cast::<u8>().add(RING_OFFSET) },
            capacity: self.geometry.capacity,
            region: self.region.name(),
            guard,
        })
    }

    fn header(&self) -> &DataHeader {
        // SAFETY: the region holds at least one header (checked on create
        // and attach) and is page aligned.
        unsafe { &*self.region.base().as_ptr().cast::<DataHeader>() }
    }

    fn channel_ptr(&self, index: usize) -> *mut ChannelHeader {
        assert!(index < self.geometry.channels, "channel index {index} out of range");
        // SAFETY: region_size() bytes are mapped.
        unsafe {
            self.region
                .base()
                .as_ptr()
                .add(HEADER_SPAN + index * self.stride)
                .cast::<ChannelHeader>()
        }
    }
}

impl std::fmt::Debug for DataChannels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannels")
            .field("region", &self.region)
            .field("geometry", &self.geometry)
            .finish()
    }
}

/// # Safety
///
/// `channel` must point into a freshly created, unpublished region.
unsafe fn init_channel(channel: *mut ChannelHeader) -> std::io::Result<()> {
    // SAFETY: guaranteed by the caller.
    unsafe {
        SharedMutex::init(addr_of_mut!((*channel).lock))?;
        if let Err(e) = SharedCondvar::init(addr_of_mut!((*channel).space_available)) {
            (*channel).lock.destroy();
            return Err(e);
        }
        if let Err(e) = SharedCondvar::init(addr_of_mut!((*channel).data_available)) {
            (*channel).space_available.destroy();
            (*channel).lock.destroy();
            return Err(e);
        }
    }
    Ok(())
}

/// # Safety
///
/// Nobody may use the channel afterwards.
unsafe fn destroy_channel(channel: &ChannelHeader) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        channel.data_available.destroy();
        channel.space_available.destroy();
        channel.lock.destroy();
    }
}

/// Worker side of one channel
pub struct ChannelWriter<'a> {
    channels: &'a DataChannels,
    index: usize,
    timeout: Duration,
    active: Option<u64>,
}

impl<'a> ChannelWriter<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Start transfer `transfer_id` of `total` bytes.
    ///
    /// Waits for the reader of the previous transfer to drain it. A reader
    /// that has not finished within the timeout is abandoned.
    pub fn begin(&mut self, transfer_id: u64, total: u64) -> Result<()> {
        if let Some(active) = self.active {
            return Err(Error::protocol(format!(
                "channel {} is still sending transfer {active}",
                self.index
            )));
        }
        let deadline = deadline_after(self.timeout);
        let mut channel = self.channels.lock(self.index)?;

        loop {
            if self.channels.is_shutting_down() {
                return Err(Error::Shutdown);
            }
            if channel.state().is_drained() {
                break;
            }
            if channel.wait_for_space(deadline)? {
                let previous = channel.state().transfer_id;
                tracing::warn!(
                    channel = self.index,
                    previous,
                    "previous transfer was never drained, reclaiming channel"
                );
                break;
            }
        }

        let state = channel.state();
        state.transfer_id = transfer_id;
        state.total = total;
        state.written = 0;
        state.read = 0;
        state.chunks = 0;
        state.end_seen = 0;
        state.set_phase(Phase::Streaming);
        channel.wake_all();

        self.active = Some(transfer_id);
        Ok(())
    }

    /// Copy one chunk into the ring, waiting for free space
    pub fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let transfer_id = self.active_transfer()?;
        let geometry = self.channels.geometry;
        if bytes.len() > geometry.chunk_size {
            return Err(Error::argument(format!(
                "chunk of {} bytes exceeds the chunk size {}",
                bytes.len(),
                geometry.chunk_size
            )));
        }

        let deadline = deadline_after(self.timeout);
        let mut channel = self.channels.lock(self.index)?;
        loop {
            if self.channels.is_shutting_down() {
                return Err(Error::Shutdown);
            }
            let state = channel.state();
            if state.transfer_id != transfer_id || state.phase() == Phase::Aborted {
                return Err(Error::transfer(
                    format!("transfer {transfer_id}"),
                    "reader abandoned the transfer",
                ));
            }
            let buffered = state.written - state.read;
            if geometry.capacity as u64 - buffered >= bytes.len() as u64 {
                break;
            }
            if channel.wait_for_space(deadline)? {
                return Err(Error::timeout(
                    format!("write chunk on channel {}", self.index),
                    self.timeout,
                ));
            }
        }

        let offset = channel.state().written;
        channel.write_ring(offset, bytes);
        let state = channel.state();
        state.written += bytes.len() as u64;
        state.chunks += 1;
        channel.channel.data_available.broadcast();
        Ok(())
    }

    /// Mark the transfer complete; the reader drains what is buffered
    pub fn finish(&mut self) -> Result<TransferReport> {
        let transfer_id = self.active_transfer()?;
        let mut channel = self.channels.lock(self.index)?;
        let state = channel.state();
        if state.transfer_id != transfer_id || state.phase() != Phase::Streaming {
            self.active = None;
            return Err(Error::transfer(
                format!("transfer {transfer_id}"),
                "transfer was aborted before it finished",
            ));
        }
        state.set_phase(Phase::Complete);
        let report = TransferReport {
            bytes: state.written,
            chunks: state.chunks,
        };
        channel.channel.data_available.broadcast();
        self.active = None;
        Ok(report)
    }

    /// Mark the transfer aborted and wake both sides
    pub fn abort(&mut self) {
        let Some(transfer_id) = self.active.take() else {
            return;
        };
        match self.channels.lock(self.index) {
            Ok(mut channel) => {
                let state = channel.state();
                if state.transfer_id == transfer_id && state.phase() == Phase::Streaming {
                    state.set_phase(Phase::Aborted);
                }
                channel.wake_all();
            }
            Err(e) => {
                tracing::warn!(channel = self.index, transfer_id, error = %e, "could not abort transfer");
            }
        }
    }

    /// Stream the started transfer's `total` bytes from `src`.
    ///
    /// Each round reads `min(chunk_size, remaining)` bytes and writes them
    /// as one chunk. On any failure the transfer is aborted before the error
    /// is returned.
    pub fn send_from<R: Read>(&mut self, mut src: R, path: &str) -> Result<TransferReport> {
        let transfer_id = self.active_transfer()?;
        let total = {
            let mut channel = self.channels.lock(self.index)?;
            let state = channel.state();
            if state.transfer_id != transfer_id {
                return Err(Error::protocol(format!(
                    "channel {} was reclaimed from transfer {transfer_id}",
                    self.index
                )));
            }
            state.total
        };

        let mut buf = vec![0u8; self.channels.geometry.chunk_size];
        let mut remaining = total;
        while remaining > 0 {
            let len = remaining.min(buf.len() as u64) as usize;
            let step = src
                .read_exact(&mut buf[..len])
                .map_err(|e| Error::transfer_io(path, e))
                .and_then(|()| self.write_chunk(&buf[..len]));
            if let Err(e) = step {
                self.abort();
                return Err(e);
            }
            remaining -= len as u64;
        }
        self.finish()
    }

    fn active_transfer(&self) -> Result<u64> {
        self.active.ok_or_else(|| {
            Error::protocol(format!("channel {} has no transfer in progress", self.index))
        })
    }
}

impl Drop for ChannelWriter<'_> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Proxy side of one transfer
pub struct ChannelReader<'a> {
    channels: &'a DataChannels,
    index: usize,
    transfer_id: u64,
    total: u64,
    timeout: Option<Duration>,
    done: bool,
}

impl<'a> ChannelReader<'a> {
    /// Size announced by the writer
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Copy up to `buf.len()` bytes; `Ok(0)` once the transfer is complete.
    ///
    /// Fails with [`Error::Shutdown`] as soon as the daemon begins shutting
    /// down, before touching the channel's primitives.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.channels.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let deadline = self.timeout.and_then(deadline_after);
        let mut channel = self.channels.lock(self.index)?;

        loop {
            let state = channel.state();
            if state.transfer_id != self.transfer_id {
                self.done = true;
                return Err(Error::protocol(format!(
                    "channel {} was reclaimed from transfer {}",
                    self.index, self.transfer_id
                )));
            }
            if state.written > state.read {
                break;
            }
            match state.phase() {
                Phase::Complete => {
                    self.done = true;
                    channel.state().end_seen = 1;
                    channel.channel.space_available.broadcast();
                    return Ok(0);
                }
                Phase::Aborted => {
                    self.done = true;
                    return Err(Error::transfer(
                        format!("transfer {}", self.transfer_id),
                        "daemon aborted the transfer",
                    ));
                }
                Phase::Idle | Phase::Streaming => {}
            }
            if self.channels.is_shutting_down() {
                return Err(Error::Shutdown);
            }
            if channel.wait_for_data(deadline)? {
                return Err(Error::timeout(
                    format!("read chunk on channel {}", self.index),
                    self.timeout.unwrap_or_default(),
                ));
            }
        }

        let state = channel.state();
        let len = (state.written - state.read).min(buf.len() as u64) as usize;
        let offset = state.read;
        channel.read_ring(offset, &mut buf[..len]);
        channel.state().read += len as u64;
        channel.channel.space_available.broadcast();
        Ok(len)
    }

    /// Drain the whole transfer into `dst`
    pub fn copy_to<W: Write>(&mut self, mut dst: W) -> Result<u64> {
        let mut buf = vec![0u8; self.channels.geometry.chunk_size];
        let mut copied = 0u64;
        loop {
            let n = self.read_chunk(&mut buf)?;
            if n == 0 {
                return Ok(copied);
            }
            dst.write_all(&buf[..n])
                .map_err(|e| Error::transfer_io(format!("transfer {}", self.transfer_id), e))?;
            copied += n as u64;
        }
    }
}

impl Drop for ChannelReader<'_> {
    fn drop(&mut self) {
        // After shutdown the daemon may already have destroyed the lock.
        if self.done || self.channels.is_shutting_down() {
            return;
        }
        if let Ok(mut channel) = self.channels.lock(self.index) {
            let state = channel.state();
            if state.transfer_id == self.transfer_id && !state.is_drained() {
                state.set_phase(Phase::Aborted);
                tracing::debug!(
                    channel = self.index,
                    transfer_id = self.transfer_id,
                    "reader dropped before the end of the transfer"
                );
            }
            channel.wake_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn unique_name() -> String {
        format!("/shmcache-test-d-{}", uuid::Uuid::new_v4().simple())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Send `payload` on channel 0 from one thread and collect it on another
    fn transfer(channels: &DataChannels, payload: &[u8]) -> (TransferReport, Vec<u8>) {
        let mut writer = channels.writer(0, TIMEOUT).unwrap();
        writer.begin(1, payload.len() as u64).unwrap();
        thread::scope(|s| {
            let receiver = s.spawn(|| {
                let mut out = Vec::new();
                let mut reader = channels.reader(0, 1, Some(TIMEOUT)).unwrap();
                assert_eq!(reader.total(), payload.len() as u64);
                reader.copy_to(&mut out).unwrap();
                out
            });
            let report = writer.send_from(Cursor::new(payload), "/payload").unwrap();
            (report, receiver.join().unwrap())
        })
    }

    #[test]
    fn test_5000_bytes_over_1024_byte_chunks() {
        let channels =
            DataChannels::create(&unique_name(), DataGeometry::new(1, 1024).unwrap()).unwrap();
        let payload = pattern(5000);
        let (report, received) = transfer(&channels, &payload);
        assert_eq!(report, TransferReport { bytes: 5000, chunks: 5 });
        assert_eq!(received, payload);
        channels.destroy().unwrap();
    }

    #[test]
    fn test_files_no_larger_than_one_chunk() {
        let channels =
            DataChannels::create(&unique_name(), DataGeometry::new(1, 1024).unwrap()).unwrap();

        let (report, received) = transfer(&channels, &pattern(100));
        assert_eq!(report.chunks, 1);
        assert_eq!(received.len(), 100);

        let (report, received) = transfer(&channels, &pattern(1024));
        assert_eq!(report.chunks, 1);
        assert_eq!(received, pattern(1024));

        let (report, received) = transfer(&channels, &[]);
        assert_eq!(report, TransferReport::default());
        assert!(received.is_empty());

        channels.destroy().unwrap();
    }

    #[test]
    fn test_reader_on_attached_mapping() {
        let daemon =
            DataChannels::create(&unique_name(), DataGeometry::with_capacity(2, 64, 256).unwrap())
                .unwrap();
        let proxy = DataChannels::attach(daemon.name()).unwrap();
        assert_eq!(proxy.geometry(), daemon.geometry());

        let payload = pattern(1000);
        let mut writer = daemon.writer(1, TIMEOUT).unwrap();
        writer.begin(9, payload.len() as u64).unwrap();
        thread::scope(|s| {
            let receiver = s.spawn(|| {
                let mut out = Vec::new();
                proxy
                    .reader(1, 9, Some(TIMEOUT))
                    .unwrap()
                    .copy_to(&mut out)
                    .unwrap();
                out
            });
            let report = writer.send_from(payload.as_slice(), "/p").unwrap();
            assert_eq!(report.chunks, 16);
            assert_eq!(receiver.join().unwrap(), payload);
        });

        proxy.detach();
        drop(writer);
        daemon.destroy().unwrap();
    }

    #[test]
    fn test_dropped_reader_aborts_writer() {
        let channels =
            DataChannels::create(&unique_name(), DataGeometry::new(1, 64).unwrap()).unwrap();
        let mut writer = channels.writer(0, TIMEOUT).unwrap();
        writer.begin(3, 1000).unwrap();
        thread::scope(|s| {
            s.spawn(|| {
                let mut reader = channels.reader(0, 3, Some(TIMEOUT)).unwrap();
                let mut buf = [0u8; 64];
                assert_eq!(reader.read_chunk(&mut buf).unwrap(), 64);
            });
            let err = writer.send_from(Cursor::new(pattern(1000)), "/big").unwrap_err();
            assert!(matches!(err, Error::Transfer { .. }), "{err:?}");
        });
        drop(writer);
        channels.destroy().unwrap();
    }

    #[test]
    fn test_writer_abort_reaches_reader() {
        let channels =
            DataChannels::create(&unique_name(), DataGeometry::new(1, 64).unwrap()).unwrap();
        let mut writer = channels.writer(0, TIMEOUT).unwrap();
        writer.begin(4, 128).unwrap();
        writer.write_chunk(&pattern(64)).unwrap();
        writer.abort();

        let mut reader = channels.reader(0, 4, Some(TIMEOUT)).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(reader.read_chunk(&mut buf).unwrap(), 64);
        assert!(matches!(reader.read_chunk(&mut buf), Err(Error::Transfer { .. })));
        drop(reader);
        drop(writer);
        channels.destroy().unwrap();
    }

    #[test]
    fn test_failing_source_aborts_transfer() {
        let channels =
            DataChannels::create(&unique_name(), DataGeometry::new(1, 64).unwrap()).unwrap();
        let mut writer = channels.writer(0, TIMEOUT).unwrap();
        writer.begin(5, 100).unwrap();
        // Only 10 bytes where 100 were announced.
        let err = writer.send_from(Cursor::new(pattern(10)), "/short").unwrap_err();
        assert!(matches!(err, Error::Transfer { ref path, .. } if path == "/short"));

        let mut reader = channels.reader(0, 5, Some(TIMEOUT)).unwrap();
        assert!(reader.read_chunk(&mut [0u8; 64]).is_err());
        drop(reader);
        drop(writer);
        channels.destroy().unwrap();
    }

    #[test]
    fn test_writer_times_out_without_reader() {
        let channels =
            DataChannels::create(&unique_name(), DataGeometry::new(1, 64).unwrap()).unwrap();
        let mut writer = channels.writer(0, Duration::from_millis(30)).unwrap();
        writer.begin(6, 128).unwrap();
        writer.write_chunk(&pattern(64)).unwrap();
        let err = writer.write_chunk(&pattern(64)).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        drop(writer);
        channels.destroy().unwrap();
    }

    #[test]
    fn test_undrained_transfer_is_reclaimed_after_timeout() {
        let channels =
            DataChannels::create(&unique_name(), DataGeometry::new(1, 64).unwrap()).unwrap();
        let mut writer = channels.writer(0, Duration::from_millis(30)).unwrap();
        writer.begin(7, 64).unwrap();
        writer.write_chunk(&pattern(64)).unwrap();
        writer.finish().unwrap();

        writer.begin(8, 0).unwrap();
        assert!(matches!(channels.reader(0, 7, None), Err(Error::Protocol { .. })));
        writer.finish().unwrap();
        drop(writer);
        channels.destroy().unwrap();
    }

    #[test]
    fn test_shutdown_wakes_blocked_reader() {
        let channels =
            DataChannels::create(&unique_name(), DataGeometry::new(1, 64).unwrap()).unwrap();
        let mut writer = channels.writer(0, TIMEOUT).unwrap();
        writer.begin(10, 64).unwrap();
        thread::scope(|s| {
            let blocked = s.spawn(|| {
                let mut reader = channels.reader(0, 10, None).unwrap();
                reader.read_chunk(&mut [0u8; 64])
            });
            thread::sleep(Duration::from_millis(50));
            channels.begin_shutdown();
            assert!(matches!(blocked.join().unwrap(), Err(Error::Shutdown)));
        });
        assert!(matches!(writer.write_chunk(&pattern(8)), Err(Error::Shutdown)));
        drop(writer);
        channels.destroy().unwrap();
    }

    #[test]
    fn test_geometry_validation() {
        assert!(DataGeometry::new(0, 1024).is_err());
        assert!(DataGeometry::new(MAX_WORKERS + 1, 1024).is_err());
        assert!(DataGeometry::new(1, MIN_CHUNK_SIZE - 1).is_err());
        assert!(DataGeometry::with_capacity(1, 1024, 1500).is_err());
        assert!(DataGeometry::with_capacity(1, 1024, 4096).is_ok());
        assert!(DataGeometry::with_capacity(1, 1024, MAX_CHANNEL_CAPACITY + 1024).is_err());
        assert!(matches!(
            DataGeometry::with_capacity(2, 4096, (usize::MAX / 2) / 4096 * 4096),
            Err(Error::Argument { .. })
        ));
    }

    #[test]
    fn test_region_size_overflow_is_an_error() {
        let geometry = DataGeometry {
            channels: MAX_WORKERS,
            chunk_size: 4096,
            capacity: usize::MAX - 4096,
        };
        assert!(matches!(geometry.region_size(), Err(Error::Argument { .. })));
        assert!(DataGeometry::new(4, 1024).unwrap().region_size().unwrap() > 4 * 1024);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_transfer_preserves_bytes_and_chunk_count(
            size in 0usize..20_000,
            chunk in prop::sample::select(vec![64usize, 100, 1024, 4096]),
            ring_chunks in 1usize..4,
        ) {
            let geometry = DataGeometry::with_capacity(1, chunk, chunk * ring_chunks).unwrap();
            let channels = DataChannels::create(&unique_name(), geometry).unwrap();
            let payload = pattern(size);
            let (report, received) = transfer(&channels, &payload);
            prop_assert_eq!(report.bytes, size as u64);
            prop_assert_eq!(report.chunks, size.div_ceil(chunk) as u64);
            prop_assert_eq!(received, payload);
            channels.destroy().unwrap();
        }
    }
}
