//! Scoped cleanup guard that runs a function on drop

/// Runs its cleanup function when dropped unless cancelled.
///
/// Used to unwind a partially completed startup: each step arms a guard and
/// the guards are cancelled together once the whole sequence succeeded.
pub struct ScopedCleanup<F: FnOnce()> {
    cleanup_fn: Option<F>,
}

impl<F: FnOnce()> ScopedCleanup<F> {
    /// Create a new scoped cleanup guard
    pub fn new(cleanup_fn: F) -> Self {
        Self {
            cleanup_fn: Some(cleanup_fn),
        }
    }

    /// Cancel the cleanup
    pub fn cancel(mut self) {
        self.cleanup_fn = None;
    }

}

impl<F: FnOnce()> Drop for ScopedCleanup<F> {
    fn drop(&mut self) {
        if let Some(cleanup_fn) = self.cleanup_fn.take() {
            cleanup_fn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_scoped_cleanup() {
        let cleaned = Cell::new(false);

        {
            let _cleanup = ScopedCleanup::new(|| cleaned.set(true));
        }

        assert!(cleaned.get());
    }

    #[test]
    fn test_scoped_cleanup_cancel() {
        let cleaned = Cell::new(false);

        {
            let cleanup = ScopedCleanup::new(|| cleaned.set(true));
            cleanup.cancel();
        }

        assert!(!cleaned.get());
    }
}
