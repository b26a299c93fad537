//! Termination signal listener
//!
//! The registered handler only records the signal number (signal-hook's
//! self-pipe). Whoever calls [`SignalListener::wait`] receives it on an
//! ordinary thread and runs the shutdown sequence there.

use shmcache_core::{Error, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

/// Blocks the calling thread until SIGINT or SIGTERM arrives
pub struct SignalListener {
    signals: Signals,
}

/// Closes a [`SignalListener`] from another thread, waking its waiter
#[derive(Clone)]
pub struct SignalHandle {
    inner: Handle,
}

impl SignalListener {
    /// Register handlers for SIGINT and SIGTERM
    pub fn install() -> Result<Self> {
        let signals = Signals::new([SIGINT, SIGTERM])
            .map_err(|e| Error::resource("SIGINT/SIGTERM", "register signal handlers", e))?;
        Ok(Self { signals })
    }

    /// Handle that can end [`wait`](Self::wait) without a signal
    pub fn handle(&self) -> SignalHandle {
        SignalHandle {
            inner: self.signals.handle(),
        }
    }

    /// Wait for the next termination signal.
    ///
    /// Returns `None` when the listener was closed through a [`SignalHandle`].
    pub fn wait(&mut self) -> Option<i32> {
        let signal = self.signals.forever().next();
        if let Some(signo) = signal {
            tracing::info!(signal = signo, "received termination signal");
        }
        signal
    }
}

impl SignalHandle {
    /// Stop the listener
    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_close_wakes_waiter() {
        let mut listener = SignalListener::install().unwrap();
        let handle = listener.handle();

        let waiter = thread::spawn(move || listener.wait());
        handle.close();

        assert_eq!(waiter.join().unwrap(), None);
    }

    #[test]
    fn test_raised_signal_is_delivered() {
        let mut listener = SignalListener::install().unwrap();

        // SAFETY: raise only delivers SIGTERM to this process, which the
        // listener has registered a handler for.
        let rc = unsafe { libc::raise(SIGTERM) };
        assert_eq!(rc, 0);

        assert_eq!(listener.wait(), Some(SIGTERM));
    }
}
