//! Resource cleanup and termination handling
//!
//! RAII guards that guarantee teardown on every exit path, and the listener
//! that turns SIGINT/SIGTERM into an ordinary value on the main thread.

mod handler;
#[cfg(unix)]
mod signals;

pub use handler::ScopedCleanup;
#[cfg(unix)]
pub use signals::{SignalHandle, SignalListener};
