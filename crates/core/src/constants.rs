/// Constants shared by the daemon and the proxy side
// Published shared memory object names
pub const REQUEST_REGION_NAME: &str = "/shmcache-requests";
pub const DATA_REGION_NAME: &str = "/shmcache-data";

// Region header magic values ("SHMCREQ1" / "SHMCDAT1")
pub const REQUEST_REGION_MAGIC: u64 = u64::from_be_bytes(*b"SHMCREQ1");
pub const DATA_REGION_MAGIC: u64 = u64::from_be_bytes(*b"SHMCDAT1");

// Longest request path a slot can hold, in bytes
pub const MAX_PATH_LEN: usize = 4096;

// Worker pool bounds
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 128;
pub const DEFAULT_WORKERS: usize = 3;

// Request queue bounds
pub const MIN_QUEUE_SLOTS: usize = 1;
pub const MAX_QUEUE_SLOTS: usize = 1024;
pub const DEFAULT_QUEUE_SLOTS: usize = 16;

// Data channel geometry
pub const MIN_CHUNK_SIZE: usize = 64;
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const MAX_CHANNEL_CAPACITY: usize = 64 * 1024 * 1024;

// Default bound on a single blocked transfer step, in milliseconds
pub const DEFAULT_TRANSFER_TIMEOUT_MS: u64 = 30_000;

// Environment variable names
pub const SHMCACHE_CONFIG_VAR: &str = "SHMCACHE_CONFIG";
pub const SHMCACHE_CACHE_DIR_VAR: &str = "SHMCACHE_CACHE_DIR";
pub const SHMCACHE_WORKERS_VAR: &str = "SHMCACHE_WORKERS";
pub const SHMCACHE_SLOTS_VAR: &str = "SHMCACHE_SLOTS";
pub const SHMCACHE_CHUNK_SIZE_VAR: &str = "SHMCACHE_CHUNK_SIZE";
pub const SHMCACHE_SHM_PREFIX_VAR: &str = "SHMCACHE_SHM_PREFIX";
