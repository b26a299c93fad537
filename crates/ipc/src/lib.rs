//! Shared memory IPC between the cache daemon and its proxy
//!
//! Two POSIX shared memory regions carry the whole protocol:
//!
//! ```text
//! request region                      data region
//! ┌──────────────────────────────┐    ┌──────────────────────────────┐
//! │ QueueHeader                  │    │ DataHeader (geometry)        │
//! │   mutex, not_full, not_empty,│    ├──────────────────────────────┤
//! │   progress, cursors, flag    │    │ channel 0: mutex, 2 condvars,│
//! ├──────────────────────────────┤    │   transfer state, ring bytes │
//! │ RequestSlot × N              │    ├──────────────────────────────┤
//! │   id, status, path, size ... │    │ channel 1 ...                │
//! └──────────────────────────────┘    └──────────────────────────────┘
//! ```
//!
//! Every structure is `#[repr(C)]` and located by offset from the region
//! base. Locks and condition variables are pthread objects initialized with
//! `PTHREAD_PROCESS_SHARED`, so the daemon's workers and the proxy process
//! can wait on the same primitives through their own mappings.

pub mod client;
pub mod data;
mod layout;
pub mod names;
pub mod queue;
pub mod shm;
pub mod sync;

pub use client::ProxyClient;
pub use data::{ChannelReader, ChannelWriter, DataChannels, DataGeometry, TransferReport};
pub use names::RegionNames;
pub use queue::{Readiness, RequestQueue, SlotRef, Ticket};
pub use shm::ShmRegion;
