//! Main axum router and the fetch-or-serve request handler.
//!
//! Routes:
//! - `GET /_repocache/healthz` - Health check
//! - `GET /_repocache/metrics` - Prometheus metrics
//! - anything else             - Proxied through the cache

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    body::{Body, HttpBody},
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{Instrument, Span, debug, error, info, instrument, warn};

use crate::AppState;
use crate::cache::{
    CacheError, CacheSink, KeyGuard, LocateError, TeeOutcome, ensure_parent, is_cached,
    tee_to_cache,
};
use crate::health::health_handler;
use crate::http::headers::{append_response_headers, upstream_request_headers};
use crate::metrics::{CacheStatus, CacheWriteResult, UpstreamErrorKind};

/// Paths under this prefix are answered by the proxy itself.
pub const ADMIN_PREFIX: &str = "/_repocache";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with the admin routes and the catch-all proxy.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&format!("{ADMIN_PREFIX}/healthz"), get(health_handler))
        .route(&format!("{ADMIN_PREFIX}/metrics"), get(handle_metrics))
        .fallback(handle_proxy)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Request failures that reach the client.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Invalid request path: {0}")]
    InvalidPath(#[from] LocateError),

    #[error("Error creating request:{url},err:{source}")]
    RequestConstruction {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Error forwarding request:{url},err:{detail}")]
    UpstreamTransport {
        url: String,
        detail: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upstream timed out:{url},err:{detail}")]
    UpstreamTimeout { url: String, detail: String },
}

impl ProxyError {
    /// Classify a failed upstream round-trip.  The detail carries the whole
    /// cause chain since reqwest's own message is usually just "error sending
    /// request".
    pub fn from_transport(url: &str, source: reqwest::Error) -> Self {
        let detail = error_chain(&source);
        if source.is_timeout() {
            ProxyError::UpstreamTimeout {
                url: url.to_string(),
                detail,
            }
        } else {
            ProxyError::UpstreamTransport {
                url: url.to_string(),
                detail,
                source,
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            ProxyError::RequestConstruction { .. } | ProxyError::UpstreamTransport { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn upstream_error_kind(&self) -> Option<UpstreamErrorKind> {
        match self {
            ProxyError::InvalidPath(_) => None,
            ProxyError::RequestConstruction { .. } => Some(UpstreamErrorKind::Request),
            ProxyError::UpstreamTransport { .. } => Some(UpstreamErrorKind::Transport),
            ProxyError::UpstreamTimeout { .. } => Some(UpstreamErrorKind::Timeout),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut detail = err.to_string();
    let mut cause = err.source();
    while let Some(e) = cause {
        detail.push_str(": ");
        detail.push_str(&e.to_string());
        cause = e.source();
    }
    detail
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Catch-all handler: serve from the cache tree or fetch from upstream.
///
/// Hits are served for `GET` and `HEAD`.  A `GET` miss takes the key lock,
/// re-checks the cache and, if still absent, streams the upstream body to the
/// client and into the cache.  Everything else is proxied without touching
/// the cache.
#[instrument(skip_all, fields(method = %request.method(), uri = %request.uri()))]
async fn handle_proxy(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ProxyError> {
    let tail = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let method = request.method().clone();
    let metrics = &state.metrics.metrics;

    let cache_path = match state.locator.locate(&tail) {
        Ok(path) => Some(path),
        Err(e @ LocateError::Traversal(_)) => return Err(e.into()),
        Err(LocateError::Uncacheable(_)) => None,
    };

    let Some(path) = cache_path.filter(|_| method == Method::GET || method == Method::HEAD)
    else {
        debug!("bypassing cache");
        metrics.record_request(CacheStatus::Bypass);
        return forward(&state, request, &tail, None).await;
    };

    if is_cached(&path).await {
        metrics.record_request(CacheStatus::Hit);
        return Ok(serve_cached(&path, request).await);
    }

    if method == Method::HEAD {
        metrics.record_request(CacheStatus::Bypass);
        return forward(&state, request, &tail, None).await;
    }

    let claim = claim_key(&state, &path).await;

    // Whoever held the key before us may have just committed the entry.
    if is_cached(&path).await {
        drop(claim);
        metrics.record_request(CacheStatus::Hit);
        return Ok(serve_cached(&path, request).await);
    }

    metrics.record_request(CacheStatus::Miss);
    forward(&state, request, &tail, claim).await
}

/// `GET /_repocache/metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(buf) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Hand a cache hit to the static file service.
async fn serve_cached(path: &std::path::Path, request: Request) -> Response {
    info!(path = %path.display(), "cache hit");
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

/// Take the write lock for a cache key, waiting behind an in-flight writer.
///
/// `None` means the wait timed out; the caller must then not touch the cache
/// path.
async fn claim_key(state: &AppState, path: &std::path::Path) -> Option<KeyGuard> {
    if let Some(guard) = state.locks.try_acquire(path) {
        return Some(guard);
    }

    let metrics = &state.metrics.metrics;
    metrics.lock_waits.inc();
    let guard = state
        .locks
        .acquire(path, state.config.cache.lock_wait_timeout())
        .await;
    if guard.is_none() {
        metrics.lock_timeouts.inc();
    }
    guard
}

/// Forward the request upstream and stream the response back.
///
/// With a `claim` the body is also written into the claimed cache path,
/// provided the response status is one we cache.
async fn forward(
    state: &AppState,
    request: Request,
    tail: &str,
    claim: Option<KeyGuard>,
) -> Result<Response, ProxyError> {
    let metrics = &state.metrics.metrics;
    let (parts, body) = request.into_parts();
    let url = state.upstream.target_url(tail);
    let headers = upstream_request_headers(&parts.headers, claim.is_some());
    let body = (!body.is_end_stream()).then(|| reqwest::Body::wrap_stream(body.into_data_stream()));

    let started = Instant::now();
    let upstream = match state
        .upstream
        .forward(parts.method.clone(), &url, headers, body)
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            if let Some(kind) = e.upstream_error_kind() {
                metrics.record_upstream_error(kind);
            }
            return Err(e);
        }
    };
    metrics
        .upstream_duration_seconds
        .observe(started.elapsed().as_secs_f64());

    let status = upstream.status();
    debug!(%url, %status, "upstream responded");

    let upstream_headers: HeaderMap = upstream.headers().clone();
    let cacheable = is_cacheable(state, &parts.method, status)
        && !has_content_coding(&upstream_headers);
    let sink = match claim.filter(|_| cacheable) {
        Some(guard) => open_sink(state, guard).await,
        None => None,
    };

    let expected_len = upstream.content_length();
    let caching = sink.is_some();
    let (rx, handle) = tee_to_cache(upstream.bytes_stream(), sink, expected_len);

    metrics.active_streams.inc();
    let outcome = record_outcome(Arc::clone(&state.metrics.metrics), handle, caching)
        .instrument(Span::current());
    if caching && expected_len == Some(0) {
        // No final chunk to hold back: the client is done as soon as it has
        // the headers, so commit first.
        outcome.await;
    } else {
        tokio::spawn(outcome);
    }

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    *response.status_mut() = status;
    append_response_headers(&upstream_headers, response.headers_mut());
    Ok(response)
}

/// `GET 200` responses are cached; error statuses only when configured.
fn is_cacheable(state: &AppState, method: &Method, status: StatusCode) -> bool {
    if method != Method::GET {
        return false;
    }
    status == StatusCode::OK
        || (state.config.cache.cache_error_responses
            && (status.is_client_error() || status.is_server_error()))
}

/// Whether the body carries a content coding other than `identity`.  Such
/// bytes are not stored: hits are served without the upstream headers.
fn has_content_coding(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .any(|value| !value.as_bytes().eq_ignore_ascii_case(b"identity"))
}

/// Prepare the temp file for a claimed key.  On failure the client is still
/// served, just without caching.
async fn open_sink(state: &AppState, guard: KeyGuard) -> Option<CacheSink> {
    let path = guard.key().to_path_buf();
    ensure_parent(&path).await;

    match CacheSink::create(path, guard) {
        Ok(sink) => {
            info!(path = %sink.path().display(), "cache miss, fetching into cache");
            Some(sink)
        }
        Err(e) => {
            warn!(error = %e, "cannot create cache file, serving without caching");
            state
                .metrics
                .metrics
                .record_cache_write(CacheWriteResult::Failed);
            None
        }
    }
}

/// Wait for a tee to finish and account for how it ended.
async fn record_outcome(
    metrics: Arc<crate::metrics::Metrics>,
    handle: tokio::task::JoinHandle<TeeOutcome>,
    caching: bool,
) {
    match handle.await {
        Ok(TeeOutcome::Cached { bytes }) => {
            metrics.streamed_bytes.inc_by(bytes);
            metrics.cache_write_bytes.inc_by(bytes);
            metrics.record_cache_write(CacheWriteResult::Committed);
            info!(bytes, "cache entry stored");
        }
        Ok(TeeOutcome::Uncached { bytes, reason }) => {
            metrics.streamed_bytes.inc_by(bytes);
            if let Some(e) = reason {
                metrics.record_cache_write(CacheWriteResult::Failed);
                warn!(error = %e, bytes, "response served but not cached");
            }
        }
        Ok(TeeOutcome::Aborted(e)) => {
            if caching {
                metrics.record_cache_write(CacheWriteResult::Aborted);
            }
            match e {
                CacheError::ClientGone(bytes) => {
                    metrics.streamed_bytes.inc_by(bytes);
                    info!(bytes, "client disconnected mid-stream");
                }
                CacheError::UpstreamBody { bytes, .. } => {
                    metrics.streamed_bytes.inc_by(bytes);
                    warn!(error = %e, "upstream body failed mid-stream");
                }
                other => warn!(error = %other, "stream aborted"),
            }
        }
        Err(e) => error!(error = %e, "stream copy task failed"),
    }
    metrics.active_streams.dec();
}
