//! Static cache index for the shmcache daemon
//!
//! The index is built once at startup, from either a directory tree or a
//! manifest file, and is never modified afterwards. Workers share it behind
//! an `Arc` and look paths up without any locking.

pub mod index;

pub use index::{CacheEntry, CacheIndex, CacheSource};

use std::path::{Path, PathBuf};

/// Resolve a manifest disk path against the manifest's directory
pub fn resolve_cache_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
