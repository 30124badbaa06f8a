//! Process-wide configuration.
//!
//! A [`CacheConfig`] is resolved once at startup (built-in defaults, then an
//! optional TOML file, then CLI overrides) and handed to every component
//! explicitly. It is immutable for the life of the process; nothing reads
//! configuration from ambient global state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Subdirectory of the cache root that namespaces this program's entries,
/// keeping them apart from whatever else lives in the root (typically the
/// OS temp directory).
pub const CACHE_NAMESPACE: &str = "packrat";

fn default_port() -> u16 {
    3030
}

fn default_cache_root() -> PathBuf {
    std::env::temp_dir()
}

fn default_ttl_seconds() -> u64 {
    86_400
}

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Immutable forwarder configuration.
///
/// Every field has a default matching the standalone behavior: cache under
/// the OS temp directory, one-day TTL, no compression, port 3030.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TCP port the server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Root directory the cache namespace lives under.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Entry time-to-live in seconds. Zero does not disable the cache; it
    /// means entries never go stale.
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Store entries gzip-compressed. The flag is fixed for the lifetime of a
    /// cache root: compressed and plain entries must not share one.
    #[serde(default)]
    pub compress: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cache_root: default_cache_root(),
            ttl_seconds: default_ttl_seconds(),
            compress: false,
        }
    }
}

impl CacheConfig {
    /// Loads configuration from a TOML file. Absent keys fall back to the
    /// built-in defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, [`ConfigError::Parse`]
    /// if it is not valid TOML for this structure.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The directory cache entries actually live in: the configured root plus
    /// the [`CACHE_NAMESPACE`] subdirectory.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_root.join(CACHE_NAMESPACE)
    }

    /// The time-to-live as a [`Duration`]. Zero means infinite freshness.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    /// Checks the configuration for values that cannot work at runtime.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_root.as_os_str().is_empty() {
            return Err("cache_root must not be empty".to_owned());
        }
        Ok(())
    }
}
