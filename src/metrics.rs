use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub cache_status: CacheStatus,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheStatus {
    /// Served from the cache tree.
    Hit,
    /// Fetched from upstream with the cache as second sink.
    Miss,
    /// Proxied without touching the cache.
    Bypass,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpstreamErrorLabels {
    pub kind: UpstreamErrorKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UpstreamErrorKind {
    Request,
    Transport,
    Timeout,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheWriteLabels {
    pub result: CacheWriteResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheWriteResult {
    Committed,
    Failed,
    Aborted,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<RequestLabels, Counter>,
    pub upstream_duration_seconds: Histogram,
    pub upstream_errors_total: Family<UpstreamErrorLabels, Counter>,

    // -- cache writes --
    pub cache_writes_total: Family<CacheWriteLabels, Counter>,
    pub cache_write_bytes: Counter,
    pub streamed_bytes: Counter,

    // -- key locks --
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,

    // -- gauges --
    pub active_streams: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "repocache_requests",
            "Proxied requests by cache status",
            requests_total.clone(),
        );

        let upstream_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 14));
        registry.register(
            "repocache_upstream_duration_seconds",
            "Time until upstream response headers arrived",
            upstream_duration_seconds.clone(),
        );

        let upstream_errors_total = Family::<UpstreamErrorLabels, Counter>::default();
        registry.register(
            "repocache_upstream_errors",
            "Failed upstream round-trips by kind",
            upstream_errors_total.clone(),
        );

        let cache_writes_total = Family::<CacheWriteLabels, Counter>::default();
        registry.register(
            "repocache_cache_writes",
            "Cache entry writes by result",
            cache_writes_total.clone(),
        );

        let cache_write_bytes = Counter::default();
        registry.register(
            "repocache_cache_write_bytes",
            "Bytes committed to the cache tree",
            cache_write_bytes.clone(),
        );

        let streamed_bytes = Counter::default();
        registry.register(
            "repocache_streamed_bytes",
            "Upstream body bytes streamed to clients",
            streamed_bytes.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "repocache_lock_waits",
            "Cache misses that queued behind an in-flight writer",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "repocache_lock_timeouts",
            "Cache misses that gave up waiting for an in-flight writer",
            lock_timeouts.clone(),
        );

        let active_streams: Gauge = Gauge::default();
        registry.register(
            "repocache_active_streams",
            "Upstream bodies currently being streamed",
            active_streams.clone(),
        );

        Self {
            requests_total,
            upstream_duration_seconds,
            upstream_errors_total,
            cache_writes_total,
            cache_write_bytes,
            streamed_bytes,
            lock_waits,
            lock_timeouts,
            active_streams,
        }
    }

    pub fn record_request(&self, cache_status: CacheStatus) {
        self.requests_total
            .get_or_create(&RequestLabels { cache_status })
            .inc();
    }

    pub fn record_upstream_error(&self, kind: UpstreamErrorKind) {
        self.upstream_errors_total
            .get_or_create(&UpstreamErrorLabels { kind })
            .inc();
    }

    pub fn record_cache_write(&self, result: CacheWriteResult) {
        self.cache_writes_total
            .get_or_create(&CacheWriteLabels { result })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
