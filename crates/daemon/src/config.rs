//! Daemon configuration with precedence and validation
//!
//! Precedence, lowest to highest: built-in defaults, the JSON config file,
//! `SHMCACHE_*` environment variables, command line arguments. The merged
//! result is validated once, before any OS resource is created.

use crate::worker::validate_worker_count;
use serde::{Deserialize, Serialize};
use shmcache_core::{
    Error, Result, DEFAULT_CHUNK_SIZE, DEFAULT_QUEUE_SLOTS, DEFAULT_TRANSFER_TIMEOUT_MS,
    DEFAULT_WORKERS, MAX_CHUNK_SIZE, MAX_QUEUE_SLOTS, MIN_CHUNK_SIZE, MIN_QUEUE_SLOTS,
    SHMCACHE_CACHE_DIR_VAR, SHMCACHE_CHUNK_SIZE_VAR, SHMCACHE_CONFIG_VAR, SHMCACHE_SHM_PREFIX_VAR,
    SHMCACHE_SLOTS_VAR, SHMCACHE_WORKERS_VAR,
};
use shmcache_ipc::{DataGeometry, RegionNames};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the effective configuration last came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    #[default]
    Default,
    ConfigFile(PathBuf),
    Environment,
    CommandLine,
}

/// Settings of one daemon instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonConfig {
    /// Directory to serve, or a manifest file listing what to serve
    pub cache_dir: PathBuf,
    /// Worker threads, one data channel each
    pub workers: usize,
    /// Request queue slots
    pub queue_slots: usize,
    /// Largest chunk moved per round
    pub chunk_size: usize,
    /// Ring bytes per data channel; defaults to one chunk
    pub channel_capacity: Option<usize>,
    /// Bound on every wait a worker does for the proxy
    pub transfer_timeout_ms: u64,
    /// Isolated region names `/{prefix}-requests` and `/{prefix}-data`
    pub shm_prefix: Option<String>,
    #[serde(skip)]
    pub source: ConfigSource,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./"),
            workers: DEFAULT_WORKERS,
            queue_slots: DEFAULT_QUEUE_SLOTS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            channel_capacity: None,
            transfer_timeout_ms: DEFAULT_TRANSFER_TIMEOUT_MS,
            shm_prefix: None,
            source: ConfigSource::Default,
        }
    }
}

impl DaemonConfig {
    /// Check every setting; nothing has been allocated yet when this fails
    pub fn validate(&self) -> Result<()> {
        validate_worker_count(self.workers as i64)?;
        if !(MIN_QUEUE_SLOTS..=MAX_QUEUE_SLOTS).contains(&self.queue_slots) {
            return Err(Error::argument(format!(
                "queue slots must be between {MIN_QUEUE_SLOTS} and {MAX_QUEUE_SLOTS}, got {}",
                self.queue_slots
            )));
        }
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(Error::argument(format!(
                "chunk size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} bytes, got {}",
                self.chunk_size
            )));
        }
        if self.transfer_timeout_ms == 0 {
            return Err(Error::argument("transfer timeout must be positive"));
        }
        if let Some(prefix) = &self.shm_prefix {
            let bare = prefix.trim_start_matches('/');
            if bare.is_empty() || bare.contains('/') || bare.len() > 200 {
                return Err(Error::argument(format!(
                    "shared memory prefix '{prefix}' must be a single non-empty name"
                )));
            }
        }
        self.geometry().map(|_| ())
    }

    /// Names of the regions this daemon publishes
    pub fn region_names(&self) -> RegionNames {
        match &self.shm_prefix {
            Some(prefix) => RegionNames::with_prefix(prefix),
            None => RegionNames::published(),
        }
    }

    /// Data region shape: one channel per worker
    pub fn geometry(&self) -> Result<DataGeometry> {
        DataGeometry::with_capacity(
            self.workers,
            self.chunk_size,
            self.channel_capacity.unwrap_or(self.chunk_size),
        )
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

/// Values given on the command line; `None` keeps the lower layers
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub cache_dir: Option<PathBuf>,
    /// Signed so that negative counts are reported, not rejected by the parser
    pub workers: Option<i64>,
    pub queue_slots: Option<usize>,
    pub chunk_size: Option<usize>,
}

/// Config file layer; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    cache_dir: Option<PathBuf>,
    workers: Option<usize>,
    queue_slots: Option<usize>,
    chunk_size: Option<usize>,
    channel_capacity: Option<usize>,
    transfer_timeout_ms: Option<u64>,
    shm_prefix: Option<String>,
}

/// Configuration loader that handles precedence
pub struct DaemonConfigLoader;

impl DaemonConfigLoader {
    /// Defaults, then the config file, then the process environment.
    ///
    /// `explicit_file` (from `--config`) must exist; otherwise the file named
    /// by `SHMCACHE_CONFIG` or the per-user default is used when present.
    pub fn load(explicit_file: Option<&Path>) -> Result<DaemonConfig> {
        Self::load_with(explicit_file, |name| std::env::var(name).ok())
    }

    /// [`load`](Self::load) with an injectable environment
    pub fn load_with<F>(explicit_file: Option<&Path>, env: F) -> Result<DaemonConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = DaemonConfig::default();

        let file = match explicit_file {
            Some(path) => Some(path.to_path_buf()),
            None => env(SHMCACHE_CONFIG_VAR)
                .map(PathBuf::from)
                .or_else(|| Self::default_config_path().filter(|path| path.exists())),
        };
        if let Some(path) = file {
            let layer = Self::load_from_config_file(&path)?;
            Self::merge_file(&mut config, layer);
            config.source = ConfigSource::ConfigFile(path);
        }

        Self::apply_env(&mut config, env)?;
        Ok(config)
    }

    /// Per-user config file: `$XDG_CONFIG_HOME/shmcache/config.json`
    pub fn default_config_path() -> Option<PathBuf> {
        let config_dir = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(dirs::config_dir)?;
        Some(config_dir.join("shmcache").join("config.json"))
    }

    fn load_from_config_file(path: &Path) -> Result<FileConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_system(path, "read config file", e))?;
        serde_json::from_str(&content).map_err(|e| Error::Json {
            message: format!("{}: {e}", path.display()),
            source: e,
        })
    }

    fn merge_file(config: &mut DaemonConfig, layer: FileConfig) {
        if let Some(cache_dir) = layer.cache_dir {
            config.cache_dir = cache_dir;
        }
        if let Some(workers) = layer.workers {
            config.workers = workers;
        }
        if let Some(slots) = layer.queue_slots {
            config.queue_slots = slots;
        }
        if let Some(chunk_size) = layer.chunk_size {
            config.chunk_size = chunk_size;
        }
        if layer.channel_capacity.is_some() {
            config.channel_capacity = layer.channel_capacity;
        }
        if let Some(timeout) = layer.transfer_timeout_ms {
            config.transfer_timeout_ms = timeout;
        }
        if layer.shm_prefix.is_some() {
            config.shm_prefix = layer.shm_prefix;
        }
    }

    fn apply_env<F>(config: &mut DaemonConfig, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut touched = false;

        if let Some(dir) = env(SHMCACHE_CACHE_DIR_VAR) {
            config.cache_dir = PathBuf::from(dir);
            touched = true;
        }
        if let Some(workers) = env(SHMCACHE_WORKERS_VAR) {
            config.workers = parse_env(SHMCACHE_WORKERS_VAR, &workers)?;
            touched = true;
        }
        if let Some(slots) = env(SHMCACHE_SLOTS_VAR) {
            config.queue_slots = parse_env(SHMCACHE_SLOTS_VAR, &slots)?;
            touched = true;
        }
        if let Some(chunk_size) = env(SHMCACHE_CHUNK_SIZE_VAR) {
            config.chunk_size = parse_env(SHMCACHE_CHUNK_SIZE_VAR, &chunk_size)?;
            touched = true;
        }
        if let Some(prefix) = env(SHMCACHE_SHM_PREFIX_VAR) {
            config.shm_prefix = Some(prefix);
            touched = true;
        }

        if touched {
            config.source = ConfigSource::Environment;
        }
        Ok(())
    }

    /// Apply command line arguments (highest precedence)
    pub fn apply_cli_args(mut config: DaemonConfig, cli: CliOverrides) -> Result<DaemonConfig> {
        if let Some(dir) = cli.cache_dir {
            config.cache_dir = dir;
        }
        if let Some(workers) = cli.workers {
            config.workers = validate_worker_count(workers)?;
        }
        if let Some(slots) = cli.queue_slots {
            config.queue_slots = slots;
        }
        if let Some(chunk_size) = cli.chunk_size {
            config.chunk_size = chunk_size;
        }

        config.source = ConfigSource::CommandLine;
        Ok(config)
    }
}

fn parse_env(name: &str, value: &str) -> Result<usize> {
    value.trim().parse().map_err(|_| {
        Error::configuration(format!("{name} must be a non-negative integer, got '{value}'"))
    })
}
