//! Configuration management for treefs

use crate::error::{Error, Result};
use crate::model::Hash;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default in-memory tree cache size: 64MB
pub const DEFAULT_TREE_CACHE_SIZE: u64 = 64 * 1024 * 1024;

/// Default in-memory blob cache size: 256MB
pub const DEFAULT_BLOB_CACHE_SIZE: u64 = 256 * 1024 * 1024;

/// Default number of concurrent backing store fetches
pub const DEFAULT_FETCH_PARALLELISM: usize = 5;

/// Default per-attempt fetch timeout (matches the kernel request timeout)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 60_000;

/// Default number of journal deltas kept in memory and on disk
pub const DEFAULT_JOURNAL_RETENTION: usize = 100_000;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backing snapshot (commit) id to mount, hex encoded
    pub snapshot: Option<String>,

    /// Directory holding the overlay records and the journal
    pub overlay_dir: PathBuf,

    /// Object store configuration
    pub store: StoreConfig,

    /// Journal configuration
    pub journal: JournalConfig,

    /// Mount configuration
    pub mount: MountConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

/// Object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Object directory used as the backing store
    pub backing_dir: PathBuf,

    /// Persist fetched objects in a local database
    pub local_cache_enabled: bool,

    /// Local object database path
    pub local_cache_dir: PathBuf,

    /// Maximum bytes of trees kept in memory
    pub tree_cache_size: u64,

    /// Maximum bytes of blobs kept in memory
    pub blob_cache_size: u64,

    /// Maximum concurrent backing store fetches
    pub fetch_parallelism: usize,

    /// Timeout for a single fetch attempt (ms)
    pub fetch_timeout_ms: u64,

    /// Retry attempts for transient fetch failures
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,

    /// Minimum blob size to compress in the local cache (bytes)
    pub compression_threshold: usize,
}

/// Journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Maximum deltas retained (0 = unlimited); live subscribers hold the floor
    pub max_deltas: usize,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// UID for files
    pub uid: u32,

    /// GID for files
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("treefs");

        Config {
            snapshot: None,
            overlay_dir: data_dir.join("overlay"),
            store: StoreConfig {
                backing_dir: data_dir.join("objects"),
                local_cache_enabled: true,
                local_cache_dir: data_dir.join("local-store"),
                tree_cache_size: DEFAULT_TREE_CACHE_SIZE,
                blob_cache_size: DEFAULT_BLOB_CACHE_SIZE,
                fetch_parallelism: DEFAULT_FETCH_PARALLELISM,
                fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
                retry_attempts: 3,
                retry_base_delay_ms: 100,
                compression_threshold: 1024,
            },
            journal: JournalConfig::default(),
            mount: MountConfig::default(),
            data_dir,
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        JournalConfig {
            max_deltas: DEFAULT_JOURNAL_RETENTION,
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            mount_point: PathBuf::from("/mnt/treefs"),
            allow_other: false,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

impl StoreConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Config {
    /// Configuration for a mount whose state lives entirely under `root`
    pub fn with_root(root: &Path) -> Self {
        let mut config = Config::default();
        config.data_dir = root.to_path_buf();
        config.overlay_dir = root.join("overlay");
        config.store.backing_dir = root.join("objects");
        config.store.local_cache_dir = root.join("local-store");
        config
    }

    /// Load configuration from a file, with environment variable overrides
    ///
    /// `.yaml`/`.yml` files are parsed as YAML, anything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        let mut config: Config = if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(snapshot) = std::env::var("TREEFS_SNAPSHOT") {
            let snapshot = snapshot.trim().to_string();
            if !snapshot.is_empty() {
                self.snapshot = Some(snapshot);
            }
        }

        if let Ok(dir) = std::env::var("TREEFS_OVERLAY_DIR") {
            if !dir.trim().is_empty() {
                self.overlay_dir = PathBuf::from(dir.trim());
            }
        }

        if let Ok(dir) = std::env::var("TREEFS_STORE_DIR") {
            if !dir.trim().is_empty() {
                self.store.backing_dir = PathBuf::from(dir.trim());
            }
        }

        if let Ok(cache_size) = std::env::var("TREEFS_CACHE_SIZE") {
            if let Ok(size) = cache_size.trim().parse::<u64>() {
                self.store.blob_cache_size = size;
            }
        }

        if let Ok(timeout) = std::env::var("TREEFS_FETCH_TIMEOUT_MS") {
            if let Ok(ms) = timeout.trim().parse::<u64>() {
                self.store.fetch_timeout_ms = ms;
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(snapshot) = &self.snapshot {
            Hash::from_hex(snapshot).map_err(|_| {
                Error::InvalidConfig(format!("snapshot {:?} is not a valid hash", snapshot))
            })?;
        }

        if self.store.fetch_parallelism == 0 {
            return Err(Error::InvalidConfig(
                "Fetch parallelism must be greater than 0".to_string(),
            ));
        }

        if self.store.fetch_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "Fetch timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed snapshot id
    pub fn snapshot_id(&self) -> Result<Hash> {
        let snapshot = self.snapshot.as_deref().ok_or_else(|| {
            Error::InvalidConfig("No snapshot configured (set TREEFS_SNAPSHOT)".to_string())
        })?;
        Hash::from_hex(snapshot)
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.overlay_dir)?;
        std::fs::create_dir_all(&self.store.backing_dir)?;
        if self.store.local_cache_enabled {
            std::fs::create_dir_all(&self.store.local_cache_dir)?;
        }
        Ok(())
    }
}
