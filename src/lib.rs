//! Transparent caching reverse proxy for a single upstream artifact
//! repository.
//!
//! The first successful `GET` for a path is streamed to the client and into
//! a file under the cache root at the same time.  Later requests for that
//! path are answered from disk without contacting the upstream.

pub mod cache;
pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod upstream;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cache::{CacheLocator, KeyLocks};
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::upstream::UpstreamClient;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub locator: CacheLocator,
    /// Cache keys with a fetch in flight.
    pub locks: KeyLocks,
    pub upstream: UpstreamClient,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let upstream =
            UpstreamClient::new(&config.upstream).context("failed to build upstream client")?;
        Ok(Self {
            locator: CacheLocator::new(&config.cache.path),
            locks: KeyLocks::new(),
            upstream,
            metrics: MetricsRegistry::new(),
            config: Arc::new(config),
        })
    }
}
