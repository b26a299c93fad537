//! Bounded request queue in shared memory
//!
//! A fixed array of request slots guarded by one process-shared mutex and
//! three condition variables:
//!
//! - `not_full`: a slot went back to EMPTY (wakes blocked enqueuers)
//! - `not_empty`: a slot became PENDING (wakes idle workers)
//! - `progress`: a request started streaming or finished (wakes proxies
//!   waiting on one specific request)
//!
//! Slot lifecycle, enforced under the lock:
//!
//! ```text
//! EMPTY ──enqueue──▶ PENDING ──dequeue──▶ IN_PROGRESS ──mark_done──▶ DONE | ERROR
//!   ▲                                                                    │
//!   └───────────────────────────── acknowledge ──────────────────────────┘
//! ```
//!
//! A slot only becomes reusable through [`RequestQueue::acknowledge`], so a
//! result can never be overwritten before the proxy has read it.

use crate::layout::align_up;
use crate::shm::ShmRegion;
use crate::sync::{deadline_after, SharedCondvar, SharedMutex, SharedMutexGuard};
use shmcache_core::{
    Completion, Error, Outcome, Result, SlotStatus, MAX_PATH_LEN, MAX_QUEUE_SLOTS,
    MIN_QUEUE_SLOTS, REQUEST_REGION_MAGIC,
};
use std::cell::UnsafeCell;
use std::mem::{align_of, size_of};
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sentinel for "no data channel assigned yet"
const NO_CHANNEL: u32 = u32::MAX;

#[repr(C)]
struct QueueHeader {
    magic: AtomicU64,
    capacity: u32,
    path_capacity: u32,
    shutdown: AtomicU32,
    _reserved: u32,
    lock: SharedMutex,
    not_full: SharedCondvar,
    not_empty: SharedCondvar,
    progress: SharedCondvar,
    state: UnsafeCell<QueueState>,
}

/// Cursors and counters, only touched with `lock` held
#[repr(C)]
struct QueueState {
    next_id: u64,
    /// Slot index where the next enqueue starts looking for an EMPTY slot
    tail: u32,
    /// Slots that are not EMPTY
    occupied: u32,
    /// Slots that are PENDING
    pending: u32,
    _reserved: u32,
}

#[repr(C)]
struct RequestSlot {
    id: u64,
    result_size: u64,
    status: u32,
    outcome: u32,
    ack: u32,
    channel: u32,
    streaming: u32,
    path_len: u32,
    path: [u8; MAX_PATH_LEN],
}

const fn slots_offset() -> usize {
    align_up(size_of::<QueueHeader>(), align_of::<RequestSlot>())
}

/// Bytes needed for a queue of `capacity` slots
pub const fn region_size(capacity: usize) -> usize {
    slots_offset() + capacity * size_of::<RequestSlot>()
}

/// Handle returned to the proxy by [`RequestQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    pub id: u64,
    pub slot: usize,
}

/// A request claimed by a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRef {
    pub id: u64,
    pub index: usize,
    pub path: String,
}

/// What a proxy waiting on its request observes first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Bytes are flowing through data channel `channel`
    Streaming { channel: usize, size: u64 },
    /// The request finished without opening a transfer
    Finished(Completion),
}

/// The shared request queue, as seen by either process
pub struct RequestQueue {
    region: ShmRegion,
    capacity: usize,
}

/// The queue with its mutex held
struct Locked<'q> {
    queue: &'q RequestQueue,
    guard: SharedMutexGuard<'q>,
}

impl<'q> Locked<'q> {
    fn state(&mut self) -> &mut QueueState {
        // SAFETY: the state is only accessed with the queue mutex held, which
        // `self.guard` proves; `&mut self` prevents overlapping borrows.
        unsafe { &mut *self.queue.header().state.get() }
    }

    fn slot(&mut self, index: usize) -> &mut RequestSlot {
        // SAFETY: as for `state`; `slot_ptr` bounds-checks the index.
        unsafe { &mut *self.queue.slot_ptr(index) }
    }

    /// The slot behind `ticket`, checked to still hold that request
    fn ticket_slot(&mut self, ticket: Ticket) -> Result<&mut RequestSlot> {
        if ticket.slot >= self.queue.capacity {
            return Err(Error::protocol(format!(
                "ticket slot {} out of range",
                ticket.slot
            )));
        }
        let slot = self.slot(ticket.slot);
        if slot.id != ticket.id || slot.status == SlotStatus::Empty as u32 {
            return Err(Error::protocol(format!(
                "slot {} no longer holds request {}",
                ticket.slot, ticket.id
            )));
        }
        Ok(slot)
    }

    /// The slot behind `claim`, checked to still be IN_PROGRESS for it
    fn claimed_slot(&mut self, claim: &SlotRef) -> Result<&mut RequestSlot> {
        let slot = self.slot(claim.index);
        if slot.id != claim.id || slot.status != SlotStatus::InProgress as u32 {
            return Err(Error::protocol(format!(
                "request {} is not in progress in slot {}",
                claim.id, claim.index
            )));
        }
        Ok(slot)
    }

    /// Wait on `cond`; `Ok(true)` means the deadline passed
    fn wait(&self, cond: &SharedCondvar, deadline: Option<Instant>) -> Result<bool> {
        cond.wait(&self.guard, deadline)
            .map_err(|e| Error::resource(self.queue.region.name(), "pthread_cond_wait", e))
    }
}

impl RequestQueue {
    /// Create the request region and initialize its primitives
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        if !(MIN_QUEUE_SLOTS..=MAX_QUEUE_SLOTS).contains(&capacity) {
            return Err(Error::argument(format!(
                "queue slots must be between {MIN_QUEUE_SLOTS} and {MAX_QUEUE_SLOTS}, got {capacity}"
            )));
        }

        let region = ShmRegion::create(name, region_size(capacity))?;
        let header = region.base().as_ptr().cast::<QueueHeader>();

        // SAFETY: the region was just created, is zero-filled, large enough
        // for the header and not yet published (magic is still zero).
        unsafe {
            addr_of_mut!((*header).capacity).write(capacity as u32);
            addr_of_mut!((*header).path_capacity).write(MAX_PATH_LEN as u32);
            (*(*header).state.get()).next_id = 1;
            init_primitives(header).map_err(|e| Error::resource(name, "pthread init", e))?;
        }

        let queue = Self { region, capacity };
        for index in 0..capacity {
            // SAFETY: not yet published, no other user.
            unsafe { (*queue.slot_ptr(index)).channel = NO_CHANNEL };
        }
        queue.header().magic.store(REQUEST_REGION_MAGIC, Ordering::Release);

        tracing::info!(region = %name, slots = capacity, "request queue created");
        Ok(queue)
    }

    /// Attach to a queue the daemon has published
    pub fn attach(name: &str) -> Result<Self> {
        let region = ShmRegion::attach(name)?;
        if region.len() < size_of::<QueueHeader>() {
            return Err(Error::protocol(format!(
                "region '{name}' is too small for a request queue"
            )));
        }
        // SAFETY: the mapping covers at least one header.
        let header = unsafe { &*region.base().as_ptr().cast::<QueueHeader>() };
        if header.magic.load(Ordering::Acquire) != REQUEST_REGION_MAGIC {
            return Err(Error::protocol(format!(
                "region '{name}' is not an initialized request queue"
            )));
        }
        let capacity = header.capacity as usize;
        if header.path_capacity as usize != MAX_PATH_LEN || region.len() < region_size(capacity) {
            return Err(Error::protocol(format!(
                "request queue '{name}' has an incompatible layout"
            )));
        }
        Ok(Self { region, capacity })
    }

    /// Destroy the primitives and unlink the region.
    ///
    /// Only the creating process may call this, after [`begin_shutdown`]
    /// and after every local waiter has returned.
    ///
    /// [`begin_shutdown`]: Self::begin_shutdown
    pub fn destroy(self) -> Result<()> {
        if !self.region.is_owner() {
            return Err(Error::protocol("only the creating process may destroy the queue"));
        }
        let header = self.header();
        header.magic.store(0, Ordering::Release);
        // SAFETY: shutdown was broadcast and the daemon's workers have been
        // joined, so nobody in this process holds or waits on them.
        unsafe {
            header.progress.destroy();
            header.not_empty.destroy();
            header.not_full.destroy();
            header.lock.destroy();
        }
        tracing::debug!(region = %self.region.name(), "request queue primitives destroyed");
        self.region.destroy()
    }

    /// Unmap the queue without touching its state
    pub fn detach(self) {
        self.region.detach();
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the daemon has started shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.header().shutdown.load(Ordering::Acquire) != 0
    }

    /// Refuse new requests and wake every waiter on every condition variable
    pub fn begin_shutdown(&self) {
        let header = self.header();
        let guard = self.lock();
        header.shutdown.store(1, Ordering::Release);
        header.not_full.broadcast();
        header.not_empty.broadcast();
        header.progress.broadcast();
        if let Err(e) = guard {
            tracing::warn!(error = %e, "broadcast shutdown without holding the queue lock");
        }
    }

    /// Submit `path`, blocking while every slot is occupied
    pub fn enqueue(&self, path: &str) -> Result<Ticket> {
        self.push(path, true)
    }

    /// Submit `path`, failing with [`Error::QueueFull`] instead of blocking
    pub fn try_enqueue(&self, path: &str) -> Result<Ticket> {
        self.push(path, false)
    }

    fn push(&self, path: &str, block: bool) -> Result<Ticket> {
        validate_path(path)?;
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let header = self.header();
        let mut locked = self.lock()?;

        loop {
            if self.is_shutting_down() {
                return Err(Error::Shutdown);
            }
            if (locked.state().occupied as usize) < self.capacity {
                break;
            }
            if !block {
                return Err(Error::QueueFull {
                    capacity: self.capacity,
                });
            }
            locked.wait(&header.not_full, None)?;
        }

        let tail = locked.state().tail as usize;
        let index = (0..self.capacity)
            .map(|step| (tail + step) % self.capacity)
            .find(|&index| locked.slot(index).status == SlotStatus::Empty as u32)
            .ok_or_else(|| Error::protocol("occupied count disagrees with slot states"))?;

        let state = locked.state();
        let id = state.next_id;
        state.next_id += 1;
        state.tail = ((index + 1) % self.capacity) as u32;
        state.occupied += 1;
        state.pending += 1;

        let slot = locked.slot(index);
        debug_assert!(SlotStatus::Empty.can_transition_to(SlotStatus::Pending));
        slot.id = id;
        slot.result_size = 0;
        slot.outcome = Outcome::Ok as u32;
        slot.ack = 0;
        slot.channel = NO_CHANNEL;
        slot.streaming = 0;
        slot.path[..path.len()].copy_from_slice(path.as_bytes());
        slot.path_len = path.len() as u32;
        slot.status = SlotStatus::Pending as u32;

        header.not_empty.signal();
        tracing::trace!(request_id = id, slot = index, path = %path, "request enqueued");
        Ok(Ticket { id, slot: index })
    }

    /// Claim the oldest PENDING request, blocking while there is none.
    ///
    /// Returns `None` once shutdown has begun; requests still pending at
    /// that point are left for their proxies to observe as `Shutdown`.
    pub fn dequeue(&self) -> Result<Option<SlotRef>> {
        let header = self.header();
        let mut locked = self.lock()?;

        loop {
            if self.is_shutting_down() {
                return Ok(None);
            }
            if locked.state().pending > 0 {
                break;
            }
            locked.wait(&header.not_empty, None)?;
        }

        let mut oldest: Option<(u64, usize)> = None;
        for index in 0..self.capacity {
            let slot = locked.slot(index);
            if slot.status == SlotStatus::Pending as u32
                && oldest.map_or(true, |(id, _)| slot.id < id)
            {
                oldest = Some((slot.id, index));
            }
        }
        let (id, index) =
            oldest.ok_or_else(|| Error::protocol("pending count disagrees with slot states"))?;

        locked.state().pending -= 1;
        let slot = locked.slot(index);
        slot.status = SlotStatus::InProgress as u32;
        let path = std::str::from_utf8(&slot.path[..slot.path_len as usize])
            .map_err(|_| Error::protocol(format!("request {id} carries a non UTF-8 path")))?
            .to_string();

        tracing::trace!(request_id = id, slot = index, "request dequeued");
        Ok(Some(SlotRef { id, index, path }))
    }

    /// Record that `claim`'s bytes now flow through data channel `channel`
    pub fn begin_transfer(&self, claim: &SlotRef, channel: usize, size: u64) -> Result<()> {
        let mut locked = self.lock()?;
        let slot = locked.claimed_slot(claim)?;
        slot.channel = channel as u32;
        slot.result_size = size;
        slot.streaming = 1;
        self.header().progress.broadcast();
        Ok(())
    }

    /// Finish `claim` with `outcome`; DONE for [`Outcome::Ok`], ERROR otherwise
    pub fn mark_done(&self, claim: &SlotRef, outcome: Outcome, result_size: u64) -> Result<()> {
        let mut locked = self.lock()?;
        let slot = locked.claimed_slot(claim)?;
        slot.status = outcome.status() as u32;
        slot.outcome = outcome as u32;
        slot.result_size = result_size;
        self.header().progress.broadcast();
        Ok(())
    }

    /// Wait until the request behind `ticket` is streaming or finished
    pub fn wait_ready(&self, ticket: Ticket, timeout: Option<Duration>) -> Result<Readiness> {
        self.wait_for(ticket, timeout, "wait for request start", |slot| {
            // A streamed request may already be DONE while its bytes still
            // sit in the channel, so streaming wins over finished.
            if slot.streaming != 0 {
                return Ok(Some(Readiness::Streaming {
                    channel: slot.channel as usize,
                    size: slot.result_size,
                }));
            }
            if SlotStatus::from_raw(slot.status)?.is_finished() {
                return completion_of(slot).map(|c| Some(Readiness::Finished(c)));
            }
            Ok(None)
        })
    }

    /// Wait until the request behind `ticket` is DONE or ERROR
    pub fn wait_completion(&self, ticket: Ticket, timeout: Option<Duration>) -> Result<Completion> {
        self.wait_for(ticket, timeout, "wait for request completion", |slot| {
            if SlotStatus::from_raw(slot.status)?.is_finished() {
                completion_of(slot).map(Some)
            } else {
                Ok(None)
            }
        })
    }

    fn wait_for<T>(
        &self,
        ticket: Ticket,
        timeout: Option<Duration>,
        operation: &str,
        mut ready: impl FnMut(&RequestSlot) -> Result<Option<T>>,
    ) -> Result<T> {
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }
        let header = self.header();
        let deadline = timeout.and_then(deadline_after);
        let mut locked = self.lock()?;

        loop {
            if let Some(value) = ready(locked.ticket_slot(ticket)?)? {
                return Ok(value);
            }
            if self.is_shutting_down() {
                return Err(Error::Shutdown);
            }
            if locked.wait(&header.progress, deadline)? {
                return Err(Error::timeout(
                    format!("{operation} {}", ticket.id),
                    timeout.unwrap_or_default(),
                ));
            }
        }
    }

    /// Confirm the result was read and release the slot
    pub fn acknowledge(&self, ticket: Ticket) -> Result<Completion> {
        let header = self.header();
        let mut locked = self.lock()?;

        let slot = locked.ticket_slot(ticket)?;
        let status = SlotStatus::from_raw(slot.status)?;
        if !status.is_finished() {
            return Err(Error::protocol(format!(
                "request {} cannot be acknowledged while {status}",
                ticket.id
            )));
        }
        let completion = completion_of(slot)?;

        slot.ack = 1;
        slot.status = SlotStatus::Empty as u32;
        slot.id = 0;
        slot.path_len = 0;
        slot.streaming = 0;
        slot.channel = NO_CHANNEL;
        locked.state().occupied -= 1;

        header.not_full.signal();
        tracing::trace!(request_id = ticket.id, slot = ticket.slot, "request acknowledged");
        Ok(completion)
    }

    /// Current status of slot `index`
    pub fn slot_status(&self, index: usize) -> Result<SlotStatus> {
        if index >= self.capacity {
            return Err(Error::argument(format!(
                "slot {index} out of range, queue has {}",
                self.capacity
            )));
        }
        let mut locked = self.lock()?;
        SlotStatus::from_raw(locked.slot(index).status)
    }

    /// Number of slots that are not EMPTY
    pub fn occupied(&self) -> Result<usize> {
        let mut locked = self.lock()?;
        Ok(locked.state().occupied as usize)
    }

    fn lock(&self) -> Result<Locked<'_>> {
        let guard = self
            .header()
            .lock
            .lock()
            .map_err(|e| Error::resource(self.region.name(), "pthread_mutex_lock", e))?;
        Ok(Locked { queue: self, guard })
    }

    fn header(&self) -> &QueueHeader {
        // SAFETY: the region is at least one header long (checked on create
        // and attach) and page aligned.
        unsafe { &*self.region.base().as_ptr().cast::<QueueHeader>() }
    }

    fn slot_ptr(&self, index: usize) -> *mut RequestSlot {
        assert!(index < self.capacity, "slot index {index} out of range");
        // SAFETY: region_size(capacity) bytes are mapped.
        unsafe {
            self.region
                .base()
                .as_ptr()
                .add(slots_offset() + index * size_of::<RequestSlot>())
                .cast::<RequestSlot>()
        }
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("region", &self.region)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Initialize the header's mutex and condition variables, undoing partial
/// work on failure.
///
/// # Safety
///
/// `header` must point into a freshly created, unpublished region.
unsafe fn init_primitives(header: *mut QueueHeader) -> std::io::Result<()> {
    // SAFETY: guaranteed by the caller.
    unsafe {
        SharedMutex::init(addr_of_mut!((*header).lock))?;
        let conds = [
            addr_of_mut!((*header).not_full),
            addr_of_mut!((*header).not_empty),
            addr_of_mut!((*header).progress),
        ];
        for (done, cond) in conds.iter().enumerate() {
            if let Err(e) = SharedCondvar::init(*cond) {
                for initialized in &conds[..done] {
                    (**initialized).destroy();
                }
                (*header).lock.destroy();
                return Err(e);
            }
        }
    }
    Ok(())
}

fn completion_of(slot: &RequestSlot) -> Result<Completion> {
    Ok(Completion {
        id: slot.id,
        status: SlotStatus::from_raw(slot.status)?,
        outcome: Outcome::from_raw(slot.outcome)?,
        result_size: slot.result_size,
    })
}

fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::argument("request path must not be empty"));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(Error::argument(format!(
            "request path is {} bytes, the limit is {MAX_PATH_LEN}",
            path.len()
        )));
    }
    Ok(())
}
