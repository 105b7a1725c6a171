use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::AppState;
use crate::upstream::UpstreamClient;

const UPSTREAM_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub cache_dir: CheckResult,
    pub upstream: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

/// The cache root must exist and accept new files.
async fn check_cache_dir(root: &Path) -> CheckResult {
    let root: PathBuf = root.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(".healthz-")
            .tempfile_in(&root)
            .map(drop)
    })
    .await;

    match result {
        Ok(Ok(())) => CheckResult::healthy(),
        Ok(Err(e)) => CheckResult::unhealthy(format!("cache directory not writable: {e}")),
        Err(e) => CheckResult::unhealthy(format!("cache directory check task failed: {e}")),
    }
}

/// Any HTTP answer from the upstream counts; only transport failures do not.
async fn check_upstream(upstream: &UpstreamClient) -> CheckResult {
    match upstream.probe(UPSTREAM_PROBE_TIMEOUT).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("HEAD {} failed: {e}", upstream.base_url())),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    match (checks.cache_dir.ok, checks.upstream.ok) {
        (true, true) => HealthStatus::Ok,
        // Hits are still served while upstream is away.
        (true, false) => HealthStatus::Degraded,
        (false, _) => HealthStatus::Unhealthy,
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /_repocache/healthz` handler.  Returns 200 on Ok/Degraded, 503 on
/// Unhealthy.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (cache_dir, upstream) = tokio::join!(
        check_cache_dir(state.locator.root()),
        check_upstream(&state.upstream),
    );

    let checks = HealthChecks {
        cache_dir,
        upstream,
    };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
