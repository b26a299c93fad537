//! Core domain types, errors, and constants for `shmcache`.
//!
//! ## Key Components
//!
//! - **`errors`**: the `Error` enum and `Result` alias shared by every crate
//!   in the workspace, split into fatal (startup) and per-request failures.
//! - **`types`**: the request slot lifecycle (`SlotStatus`) and per-request
//!   outcomes as they are stored in shared memory.
//! - **`constants`**: published shared memory names and configuration bounds
//!   that the daemon and the proxy must agree on.

pub mod constants;
pub mod errors;
pub mod types;

pub use self::{
    constants::*,
    errors::{Error, Result},
    types::*,
};
