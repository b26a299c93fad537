//! Named POSIX shared memory regions
//!
//! | operation          | OS calls                                   |
//! |--------------------|--------------------------------------------|
//! | [`ShmRegion::create`] | `shm_open(O_CREAT|O_EXCL)`, `ftruncate`, `mmap` |
//! | [`ShmRegion::attach`] | `shm_open`, `fstat`, `mmap`             |
//! | [`ShmRegion::detach`] | `munmap`                                |
//! | [`destroy`]        | `shm_unlink` (idempotent)                  |
//!
//! A region created by this process unlinks its name when it is dropped
//! without [`ShmRegion::destroy`] or [`ShmRegion::detach`], so a failed
//! startup cannot leave an OS-visible object behind.

use memmap2::{MmapMut, MmapOptions};
use shmcache_core::{Error, Result};
use shmcache_utils::ScopedCleanup;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::ptr::NonNull;

/// Longest name accepted by `shm_open` on Linux
const NAME_MAX: usize = 255;

/// A mapped shared memory object
pub struct ShmRegion {
    name: String,
    // Keeps the mapping alive; all access goes through `base`.
    _map: MmapMut,
    base: NonNull<u8>,
    len: usize,
    owner: bool,
}

// SAFETY: the region is plain memory shared with other processes anyway.
// Every structure placed in it is either immutable after initialization or
// guarded by a process-shared pthread mutex living in the region itself.
unsafe impl Send for ShmRegion {}
// SAFETY: see above.
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new, zero-filled region of `size` bytes.
    ///
    /// Fails with [`Error::Resource`] if `name` already exists; a stale
    /// object from a crashed daemon must be removed with [`destroy`] first.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = validate_name(name)?;
        if size == 0 {
            return Err(Error::argument(format!(
                "shared memory region '{name}' must not be empty"
            )));
        }

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(Error::resource(name, "shm_open", io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned by shm_open and nothing else owns it.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

        let unlink_on_error = ScopedCleanup::new(|| {
            let _ = unlink(name);
        });

        file.set_len(size as u64)
            .map_err(|e| Error::resource(name, "ftruncate", e))?;

        // SAFETY: the object was created exclusively above and sized to
        // `size`. Other processes only touch it through the process-shared
        // primitives placed inside it.
        let mut map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| Error::resource(name, "mmap", e))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| Error::protocol(format!("mapping of '{name}' returned null")))?;

        unlink_on_error.cancel();
        tracing::debug!(region = %name, size, "created shared memory region");

        Ok(Self {
            name: name.to_string(),
            _map: map,
            base,
            len: size,
            owner: true,
        })
    }

    /// Map an existing region published by the daemon
    pub fn attach(name: &str) -> Result<Self> {
        let c_name = validate_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            return Err(Error::resource(name, "shm_open", io::Error::last_os_error()));
        }
        // SAFETY: fd was just returned by shm_open and nothing else owns it.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

        let len = file
            .metadata()
            .map_err(|e| Error::resource(name, "fstat", e))?
            .len() as usize;
        if len == 0 {
            return Err(Error::protocol(format!(
                "shared memory region '{name}' has not been sized yet"
            )));
        }

        // SAFETY: the mapping covers exactly the object's current size and
        // shared state inside it is only accessed under its own locks.
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file) }
            .map_err(|e| Error::resource(name, "mmap", e))?;
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| Error::protocol(format!("mapping of '{name}' returned null")))?;

        tracing::debug!(region = %name, size = len, "attached shared memory region");

        Ok(Self {
            name: name.to_string(),
            _map: map,
            base,
            len,
            owner: false,
        })
    }

    /// Unmap the region without removing its name
    pub fn detach(mut self) {
        self.owner = false;
    }

    /// Unmap the region and unlink its name
    pub fn destroy(mut self) -> Result<()> {
        self.owner = false;
        let name = std::mem::take(&mut self.name);
        drop(self);
        destroy(&name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this mapping created the object and is responsible for it
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Start of the mapping; valid for [`len`](Self::len) bytes while `self` lives
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = unlink(&self.name) {
                tracing::warn!(region = %self.name, error = %e, "failed to unlink shared memory region");
            }
        }
    }
}

impl std::fmt::Debug for ShmRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Remove a region's name. Succeeds if the name does not exist.
pub fn destroy(name: &str) -> Result<()> {
    validate_name(name)?;
    unlink(name).map_err(|e| Error::resource(name, "shm_unlink", e))
}

fn unlink(name: &str) -> io::Result<()> {
    let c_name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_name is a valid NUL-terminated string.
    let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Validate a POSIX shared memory name: one leading slash and nothing else
/// that the kernel would reject
fn validate_name(name: &str) -> Result<CString> {
    let reason = if !name.starts_with('/') {
        Some("must start with '/'")
    } else if name.len() < 2 {
        Some("must not be empty after the leading '/'")
    } else if name.len() > NAME_MAX {
        Some("is longer than 255 bytes")
    } else if name[1..].contains('/') {
        Some("must not contain '/' after the first character")
    } else {
        None
    };
    if let Some(reason) = reason {
        return Err(Error::argument(format!(
            "shared memory name '{name}' {reason}"
        )));
    }
    CString::new(name)
        .map_err(|_| Error::argument(format!("shared memory name '{name}' contains NUL")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        format!("/shmcache-test-{}", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_create_attach_share_bytes() {
        let name = unique_name();
        let owner = ShmRegion::create(&name, 4096).unwrap();
        let peer = ShmRegion::attach(&name).unwrap();
        assert_eq!(peer.len(), 4096);
        assert!(owner.is_owner());
        assert!(!peer.is_owner());

        // SAFETY: both mappings cover at least 4096 bytes; the test is single threaded.
        unsafe {
            owner.base().as_ptr().add(17).write(0xAB);
            assert_eq!(peer.base().as_ptr().add(17).read(), 0xAB);
        }

        peer.detach();
        owner.destroy().unwrap();
        assert!(ShmRegion::attach(&name).is_err());
    }

    #[test]
    fn test_create_rejects_existing_name() {
        let name = unique_name();
        let _owner = ShmRegion::create(&name, 64).unwrap();
        let err = ShmRegion::create(&name, 64).unwrap_err();
        assert!(matches!(err, Error::Resource { .. }));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let name = unique_name();
        let region = ShmRegion::create(&name, 64).unwrap();
        region.destroy().unwrap();
        destroy(&name).unwrap();
        destroy(&name).unwrap();
    }

    #[test]
    fn test_drop_of_owner_unlinks_name() {
        let name = unique_name();
        drop(ShmRegion::create(&name, 64).unwrap());
        let again = ShmRegion::create(&name, 64).unwrap();
        again.destroy().unwrap();
    }

    #[test]
    fn test_detached_owner_leaves_name() {
        let name = unique_name();
        ShmRegion::create(&name, 64).unwrap().detach();
        assert!(ShmRegion::attach(&name).is_ok());
        destroy(&name).unwrap();
    }

    #[test]
    fn test_invalid_names() {
        for bad in ["", "/", "no-slash", "/a/b"] {
            assert!(
                matches!(ShmRegion::create(bad, 64), Err(Error::Argument { .. })),
                "{bad:?} should be rejected"
            );
        }
        let long = format!("/{}", "x".repeat(NAME_MAX));
        assert!(validate_name(&long).is_err());
    }
}
