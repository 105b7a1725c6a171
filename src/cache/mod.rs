//! On-disk artifact cache.
//!
//! Provides the [`CacheLocator`] that maps request URIs to cache paths, the
//! per-key [`KeyLocks`] that serialize cache-file creation, and the tee that
//! streams an upstream body to the client and into a cache file at once.

use std::io;
use std::path::{Path, PathBuf};

pub mod locator;
pub mod locks;
pub mod tee;

pub use locator::{CacheLocator, LocateError, ensure_parent};
pub use locks::{KeyGuard, KeyLocks};
pub use tee::{CacheSink, TeeOutcome, tee_to_cache};

/// Suffix of in-progress cache files.  Never served as cache entries.
pub const TEMP_SUFFIX: &str = ".repocache-part";

/// Failures of the cache write path.  Logged and counted, never shown to
/// the client.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to create temp file in {}: {source}", dir.display())]
    CreateTemp { dir: PathBuf, source: io::Error },

    #[error("failed to write cache file {}: {source}", path.display())]
    CacheWrite { path: PathBuf, source: io::Error },

    #[error("cache file {} incomplete: expected {expected} bytes, got {actual}", path.display())]
    Incomplete {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("failed to move cache file into place at {}: {source}", path.display())]
    Commit { path: PathBuf, source: io::Error },

    #[error("client went away after {0} bytes")]
    ClientGone(u64),

    #[error("upstream body failed after {bytes} bytes: {message}")]
    UpstreamBody { bytes: u64, message: String },
}

/// Whether a cache entry is present at `path`.
///
/// Any stat error counts as absent so the caller falls through to an
/// upstream fetch.
pub async fn is_cached(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file(),
        Err(_) => false,
    }
}
