//! Published names of the two shared memory regions

use shmcache_core::{DATA_REGION_NAME, REQUEST_REGION_NAME};

/// The pair of shared memory object names one daemon publishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionNames {
    pub requests: String,
    pub data: String,
}

impl RegionNames {
    /// The fixed names a proxy attaches to without any discovery
    pub fn published() -> Self {
        Self {
            requests: REQUEST_REGION_NAME.to_string(),
            data: DATA_REGION_NAME.to_string(),
        }
    }

    /// Names derived from `prefix`, e.g. `/{prefix}-requests`
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_start_matches('/');
        Self {
            requests: format!("/{prefix}-requests"),
            data: format!("/{prefix}-data"),
        }
    }
}

impl Default for RegionNames {
    fn default() -> Self {
        Self::published()
    }
}
