//! Process-shared mutex and condition variable
//!
//! Thin wrappers over pthread objects that live *inside* a shared memory
//! region. They are never constructed by value: the creating process calls
//! `init` on a pointer into the zero-filled region, every process then uses
//! them through references into its own mapping, and the creator calls
//! `destroy` during teardown once nobody can be waiting any more.
//!
//! On Linux the mutex is robust: if a process dies while holding it, the
//! next locker recovers it instead of blocking forever. The data it guarded
//! may be half updated; callers re-check their invariants after every wake.

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::time::{Duration, Instant};

#[cfg(target_os = "linux")]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

/// Deadline `timeout` from now, or `None` if it lies beyond what
/// `Instant` can represent
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

fn os_result(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Mutex usable by every process that maps the region holding it
#[repr(C)]
pub struct SharedMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: pthread mutexes are designed for concurrent use; this one is
// additionally initialized with PTHREAD_PROCESS_SHARED.
unsafe impl Sync for SharedMutex {}
// SAFETY: see above.
unsafe impl Send for SharedMutex {}

impl SharedMutex {
    /// Initialize a process-shared mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable, suitably aligned memory that stays
    /// mapped for as long as the mutex is used, and no thread in any process
    /// may use the mutex before this returns.
    pub unsafe fn init(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        // SAFETY: attr is a valid out-pointer.
        os_result(unsafe { libc::pthread_mutexattr_init(attr.as_mut_ptr()) })?;

        // SAFETY: attr was initialized above; `this` is valid per the contract.
        let rc = unsafe {
            let mut rc = libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            #[cfg(target_os = "linux")]
            if rc == 0 {
                rc = libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST);
            }
            if rc == 0 {
                libc::pthread_mutex_init(UnsafeCell::raw_get(std::ptr::addr_of!((*this).raw)), attr.as_ptr())
            } else {
                rc
            }
        };
        // SAFETY: attr was initialized above and is not used afterwards.
        unsafe { libc::pthread_mutexattr_destroy(attr.as_mut_ptr()) };
        os_result(rc)
    }

    /// Block until the mutex is held by the calling thread
    pub fn lock(&self) -> io::Result<SharedMutexGuard<'_>> {
        // SAFETY: the mutex was initialized by `init` before being shared.
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        self.recover(rc)?;
        Ok(SharedMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Turn a lock result into success, repairing the mutex if its previous
    /// owner died while holding it
    fn recover(&self, rc: libc::c_int) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        if rc == libc::EOWNERDEAD {
            tracing::warn!("previous owner of a shared mutex died while holding it, recovering");
            // SAFETY: EOWNERDEAD means the calling thread now holds the mutex.
            return os_result(unsafe { libc::pthread_mutex_consistent(self.raw.get()) });
        }
        os_result(rc)
    }

    /// Release the OS state of the mutex.
    ///
    /// # Safety
    ///
    /// The mutex must be unlocked and no thread in any process may use it
    /// afterwards.
    pub unsafe fn destroy(&self) {
        // SAFETY: guaranteed by the caller.
        let rc = unsafe { libc::pthread_mutex_destroy(self.raw.get()) };
        if rc != 0 {
            tracing::warn!(error = %io::Error::from_raw_os_error(rc), "pthread_mutex_destroy failed");
        }
    }
}

/// Holds a [`SharedMutex`] until dropped
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
    // pthread mutexes must be unlocked by the thread that locked them
    _not_send: PhantomData<*const ()>,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard proves the calling thread holds the mutex.
        unsafe { libc::pthread_mutex_unlock(self.mutex.raw.get()) };
    }
}

/// Condition variable usable by every process that maps the region holding it
#[repr(C)]
pub struct SharedCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: pthread condition variables are designed for concurrent use; this
// one is additionally initialized with PTHREAD_PROCESS_SHARED.
unsafe impl Sync for SharedCondvar {}
// SAFETY: see above.
unsafe impl Send for SharedCondvar {}

impl SharedCondvar {
    /// Initialize a process-shared condition variable in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`SharedMutex::init`].
    pub unsafe fn init(this: *mut Self) -> io::Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        // SAFETY: attr is a valid out-pointer.
        os_result(unsafe { libc::pthread_condattr_init(attr.as_mut_ptr()) })?;

        // SAFETY: attr was initialized above; `this` is valid per the contract.
        let rc = unsafe {
            let mut rc = libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            #[cfg(target_os = "linux")]
            if rc == 0 {
                rc = libc::pthread_condattr_setclock(attr.as_mut_ptr(), WAIT_CLOCK);
            }
            if rc == 0 {
                rc = libc::pthread_cond_init(UnsafeCell::raw_get(std::ptr::addr_of!((*this).raw)), attr.as_ptr());
            }
            rc
        };
        // SAFETY: attr was initialized above and is not used afterwards.
        unsafe { libc::pthread_condattr_destroy(attr.as_mut_ptr()) };
        os_result(rc)
    }

    /// Atomically release `guard`'s mutex and wait for a signal.
    ///
    /// With a `deadline` the wait gives up once it has passed; the return
    /// value is `true` when that happened. Spurious wakeups return `false`,
    /// so callers always re-check their predicate.
    pub fn wait(&self, guard: &SharedMutexGuard<'_>, deadline: Option<Instant>) -> io::Result<bool> {
        let mutex = guard.mutex.raw.get();
        let Some(deadline) = deadline else {
            // SAFETY: the guard proves `mutex` is held by this thread.
            let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), mutex) };
            guard.mutex.recover(rc)?;
            return Ok(false);
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(true);
        }
        let abstime = abs_deadline(remaining)?;
        // SAFETY: the guard proves `mutex` is held by this thread.
        let rc = unsafe { libc::pthread_cond_timedwait(self.raw.get(), mutex, &abstime) };
        match rc {
            libc::ETIMEDOUT => Ok(true),
            rc => guard.mutex.recover(rc).map(|()| false),
        }
    }

    /// Wake one waiter
    pub fn signal(&self) {
        // SAFETY: the condition variable was initialized before being shared.
        unsafe { libc::pthread_cond_signal(self.raw.get()) };
    }

    /// Wake every waiter
    pub fn broadcast(&self) {
        // SAFETY: the condition variable was initialized before being shared.
        unsafe { libc::pthread_cond_broadcast(self.raw.get()) };
    }

    /// Release the OS state of the condition variable.
    ///
    /// # Safety
    ///
    /// No thread in any process may be waiting on it or use it afterwards.
    pub unsafe fn destroy(&self) {
        // SAFETY: guaranteed by the caller.
        let rc = unsafe { libc::pthread_cond_destroy(self.raw.get()) };
        if rc != 0 {
            tracing::warn!(error = %io::Error::from_raw_os_error(rc), "pthread_cond_destroy failed");
        }
    }
}

/// Absolute `WAIT_CLOCK` time `timeout` from now
fn abs_deadline(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    // SAFETY: now is a valid out-pointer.
    if unsafe { libc::clock_gettime(WAIT_CLOCK, now.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: clock_gettime succeeded and filled `now`.
    let now = unsafe { now.assume_init() };

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000);
    Ok(libc::timespec {
        tv_sec: secs.min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[repr(C)]
    struct Pair {
        lock: SharedMutex,
        cond: SharedCondvar,
        flag: AtomicBool,
    }

    /// A pair initialized in heap memory; process-shared objects work the
    /// same way within one process.
    fn new_pair() -> Arc<Pair> {
        let pair: Arc<MaybeUninit<Pair>> = Arc::new(MaybeUninit::zeroed());
        let ptr = pair.as_ptr() as *mut Pair;
        // SAFETY: ptr is valid, zeroed and not yet shared with another thread.
        unsafe {
            SharedMutex::init(std::ptr::addr_of_mut!((*ptr).lock)).unwrap();
            SharedCondvar::init(std::ptr::addr_of_mut!((*ptr).cond)).unwrap();
        }
        // SAFETY: every field is initialized (the atomic is valid when zeroed).
        unsafe { Arc::from_raw(Arc::into_raw(pair) as *const Pair) }
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let pair = new_pair();
        let waiter = {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                let guard = pair.lock.lock().unwrap();
                while !pair.flag.load(Ordering::SeqCst) {
                    pair.cond.wait(&guard, None).unwrap();
                }
            })
        };

        {
            let _guard = pair.lock.lock().unwrap();
            pair.flag.store(true, Ordering::SeqCst);
            pair.cond.broadcast();
        }
        waiter.join().unwrap();
    }

    #[test]
    fn test_timed_wait_expires() {
        let pair = new_pair();
        let guard = pair.lock.lock().unwrap();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(50);
        let mut timed_out = false;
        while !timed_out {
            timed_out = pair.cond.wait(&guard, Some(deadline)).unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_past_deadline_returns_immediately() {
        let pair = new_pair();
        let guard = pair.lock.lock().unwrap();
        assert!(pair.cond.wait(&guard, Some(Instant::now())).unwrap());
    }

    #[test]
    fn test_deadline_after_huge_timeout_is_unbounded() {
        assert!(deadline_after(Duration::MAX).is_none());
        assert!(deadline_after(Duration::from_secs(1)).is_some());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_mutex_of_dead_owner_is_recovered() {
        let pair = new_pair();
        {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                // The thread exits still holding the mutex.
                std::mem::forget(pair.lock.lock().unwrap());
            })
            .join()
            .unwrap();
        }

        let guard = pair.lock.lock().unwrap();
        drop(guard);
        // Consistent again, so later lockers see an ordinary mutex.
        drop(pair.lock.lock().unwrap());
    }
}
