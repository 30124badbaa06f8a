//! On-disk response store.
//!
//! Entries are raw response bodies written at the path their [`CacheKey`]
//! implies. Freshness is a judgment made at read time from the file's
//! modification time against the configured TTL; nothing is ever deleted,
//! a stale entry is simply overwritten by the next successful fetch. Writes
//! land in a hidden temp sibling and are renamed into place, so a reader
//! never observes a partially written entry.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::config::CacheConfig;

pub mod key;

pub use key::CacheKey;

/// Outcome of a store lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Entry exists and its age is within the TTL.
    Fresh(Bytes),
    /// Entry exists but has outlived the TTL. Callers treat this as a miss
    /// and overwrite the entry with the refetched bytes.
    Stale(Bytes),
    /// No entry at this key.
    Miss,
}

/// Errors raised by the store.
///
/// A directory that already exists is never an error here; concurrent writers
/// racing to create the same parents is expected operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("gzip codec failure: {0}")]
    Codec(std::io::Error),
}

/// Disk-backed response store with read-time TTL and an optional gzip codec
/// applied uniformly to every entry.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
    ttl: Duration,
    compress: bool,
}

impl CacheStore {
    /// Creates a store over the config's namespaced cache directory and
    /// ensures that directory exists.
    ///
    /// # Errors
    ///
    /// Filesystem errors from creating the directory, other than it already
    /// existing.
    pub async fn open(config: &CacheConfig) -> Result<Self, StoreError> {
        let store = Self::new(config);
        fs::create_dir_all(&store.dir).await?;
        Ok(store)
    }

    /// Creates a store without touching the filesystem. [`CacheStore::put`]
    /// creates any missing directories on demand.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            dir: config.cache_dir(),
            ttl: config.ttl(),
            compress: config.compress,
        }
    }

    /// Looks up the entry for `key`, decoding it if the store is compressed.
    ///
    /// # Errors
    ///
    /// I/O failures other than the file being absent, and compressed entries
    /// that do not decode.
    pub async fn get(&self, key: &CacheKey) -> Result<Lookup, StoreError> {
        let path = self.entry_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Lookup::Miss),
            Err(e) => return Err(e.into()),
        };
        let body = if self.compress {
            Bytes::from(gzip_decode(&raw).map_err(StoreError::Codec)?)
        } else {
            Bytes::from(raw)
        };
        let modified = fs::metadata(&path).await?.modified()?;
        if self.is_fresh(modified) {
            Ok(Lookup::Fresh(body))
        } else {
            Ok(Lookup::Stale(body))
        }
    }

    /// Writes `body` as the entry for `key`, creating missing parent
    /// directories and replacing any previous entry in place.
    ///
    /// The bytes go to a dotted temp sibling first and are renamed over the
    /// real path, so a crash mid-write leaves no partial entry behind.
    ///
    /// # Errors
    ///
    /// Directory creation, write, or rename failures; encoding failures when
    /// the store is compressed.
    pub async fn put(&self, key: &CacheKey, body: &[u8]) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = temp_sibling(&path);
        if self.compress {
            fs::write(&tmp, gzip_encode(body).map_err(StoreError::Codec)?).await?;
        } else {
            fs::write(&tmp, body).await?;
        }
        fs::rename(&tmp, &path).await?;
        debug!(key = %key, bytes = body.len(), "stored cache entry");
        Ok(())
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.relative_path())
    }

    fn is_fresh(&self, modified: SystemTime) -> bool {
        if self.ttl.is_zero() {
            return true;
        }
        match modified.elapsed() {
            Ok(age) => age < self.ttl,
            // Modification time in the future: the clock moved, call it fresh.
            Err(_) => true,
        }
    }
}

/// Temp sibling used for atomic writes. Entry file names always start with a
/// method prefix, so the dotted name cannot collide with a real entry.
fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn gzip_encode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gzip_decode(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
