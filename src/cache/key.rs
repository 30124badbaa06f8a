//! Cache key derivation.
//!
//! A [`CacheKey`] is both the lookup identity of a cached response and the
//! relative filesystem path it is stored at. The layout mirrors the target
//! itself: `host[:port]/path-segments.../METHOD:file[?params]`, so the cache
//! tree can be browsed with ordinary shell tools.
//!
//! The layout is deliberately human-readable rather than collision-proof:
//! parameter strings are not hashed and characters are not escaped beyond the
//! normalization `url::Url` already performs (lowercased host, resolved dot
//! segments, default ports elided). Hashing the file suffix would harden the
//! scheme against exotic query strings at the cost of a browsable tree.

use std::fmt;
use std::path::{Path, PathBuf};

use url::Url;

use crate::http::Method;
use crate::params::ParamMap;

/// File stub used when the target path has no dotted final segment.
const SENTINEL_FILE: &str = "index.html";

/// A derived cache key: a directory part mirroring `host/path` and a file
/// part encoding the method and parameters.
///
/// Derivation is deterministic: the same method, effective target URL, and
/// parameter set always produce the same key, independent of the order the
/// parameters were inserted in (the map is ordered by key).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    dir: String,
    file: String,
}

impl CacheKey {
    /// Derives the key for a request.
    ///
    /// `host+path` is split at the last `/`: a final segment containing a `.`
    /// becomes the file stub, anything else leaves the whole string as the
    /// directory and the stub falls back to `index.html`. The file name is
    /// `METHOD:stub`, suffixed with `?k=v&...` from the explicit parameter
    /// map or, for a GET without explicit parameters, the verbatim query
    /// string. POST query strings stay out of the key; they still reach the
    /// upstream on the target URL.
    pub fn derive(method: &Method, target: &Url, params: &ParamMap) -> Self {
        let host = target.host_str().unwrap_or_default();
        let host_port = match target.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        let host_path = format!("{host_port}{}", target.path().trim_end_matches('/'));

        let (dir, stub) = split_host_path(&host_path);
        let stub = if stub.is_empty() { SENTINEL_FILE } else { stub };

        let suffix = if params.is_empty() {
            match method {
                Method::Get => target.query().unwrap_or_default().to_owned(),
                _ => String::new(),
            }
        } else {
            params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("&")
        };

        let mut file = format!("{}:{stub}", method.as_str());
        if !suffix.is_empty() {
            file.push('?');
            file.push_str(&suffix);
        }

        Self {
            dir: dir.to_owned(),
            file,
        }
    }

    /// The key as a relative filesystem path under the store's root.
    pub fn relative_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.file)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dir, self.file)
    }
}

/// Splits `host+path` into directory and file stub at the last `/`. A final
/// segment without a `.` is a path component, not a file, so the whole string
/// becomes the directory.
fn split_host_path(host_path: &str) -> (&str, &str) {
    match host_path.rsplit_once('/') {
        Some((dir, last)) if last.contains('.') => (dir, last),
        _ => (host_path, ""),
    }
}
