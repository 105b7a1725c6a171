//! End-to-end tests: the proxy router in front of a stub upstream.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;
use tower::ServiceExt;

use repocache::AppState;
use repocache::config::Config;
use repocache::http::create_router;

const JAR_PATH: &str = "/org/example/lib/1.0/lib-1.0.jar";

fn jar_bytes() -> Vec<u8> {
    (0..1024u32).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Stub upstream
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Stub {
    hits: Arc<AtomicUsize>,
}

impl Stub {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn stub_handler(State(stub): State<Stub>, request: Request) -> Response {
    stub.hits.fetch_add(1, Ordering::SeqCst);
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    match (method, path.as_str()) {
        (Method::POST, _) => {
            let body = axum::body::to_bytes(request.into_body(), usize::MAX)
                .await
                .unwrap();
            format!("received {} bytes", body.len()).into_response()
        }
        (_, JAR_PATH) => (
            [(header::CONTENT_TYPE, "application/java-archive")],
            jar_bytes(),
        )
            .into_response(),
        (_, "/slow.jar") => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            jar_bytes().into_response()
        }
        (_, "/evil") => "EVIL".into_response(),
        (_, "/b.jar") => "GOOD".into_response(),
        (_, "/empty.txt") => "".into_response(),
        (_, "/stalled.jar") => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            jar_bytes().into_response()
        }
        (_, "/encoded.jar") => (
            [(header::CONTENT_ENCODING, "gzip")],
            b"\x1f\x8b not really gzip".to_vec(),
        )
            .into_response(),
        (_, "/echo") => {
            let mut names: Vec<String> =
                request.headers().keys().map(|k| k.to_string()).collect();
            names.sort();
            let mut response = names.join("\n").into_response();
            let headers = response.headers_mut();
            headers.insert("x-upstream", HeaderValue::from_static("yes"));
            headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
            headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
            response
        }
        _ => (StatusCode::NOT_FOUND, "not here").into_response(),
    }
}

async fn spawn_stub() -> (Stub, String) {
    let stub = Stub::default();
    let app = Router::new()
        .fallback(stub_handler)
        .with_state(stub.clone());
    let url = format!("http://{}", serve(app).await);
    (stub, url)
}

/// An upstream URL nothing listens on.
fn closed_upstream() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

// ---------------------------------------------------------------------------
// Proxy under test
// ---------------------------------------------------------------------------

fn proxy_router(upstream: &str, cache_root: &Path, tweak: impl FnOnce(&mut Config)) -> Router {
    let mut config = Config::default();
    config.upstream.url = upstream.to_string();
    config.upstream.connect_timeout = 2;
    config.cache.path = cache_root.to_path_buf();
    tweak(&mut config);
    create_router(Arc::new(AppState::new(config).unwrap()))
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

async fn spawn_proxy(upstream: &str, cache_root: &Path) -> String {
    let addr = serve(proxy_router(upstream, cache_root, |_| {})).await;
    format!("http://{addr}")
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn temp_files_under(root: &Path) -> usize {
    let mut count = 0;
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.to_string_lossy().ends_with(repocache::cache::TEMP_SUFFIX) {
                count += 1;
            }
        }
    }
    count
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn miss_then_hit_serves_identical_bytes() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;
    let client = reqwest::Client::new();

    let first = client.get(format!("{proxy}{JAR_PATH}")).send().await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.bytes().await.unwrap().as_ref(), jar_bytes().as_slice());

    let stored = cache.path().join("org/example/lib/1.0/lib-1.0.jar");
    assert_eq!(std::fs::read(&stored).unwrap(), jar_bytes());
    assert_eq!(temp_files_under(cache.path()), 0);

    let second = client.get(format!("{proxy}{JAR_PATH}")).send().await.unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.bytes().await.unwrap().as_ref(), jar_bytes().as_slice());
    assert_eq!(stub.hits(), 1);
}

#[tokio::test]
async fn hit_never_contacts_upstream() {
    let cache = tempfile::tempdir().unwrap();
    let stored = cache.path().join("org/example/lib/1.0");
    std::fs::create_dir_all(&stored).unwrap();
    std::fs::write(stored.join("lib-1.0.pom"), b"<project/>").unwrap();

    let proxy = spawn_proxy(&closed_upstream(), cache.path()).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{proxy}/org/example/lib/1.0/lib-1.0.pom"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"<project/>");

    let head = client
        .head(format!("{proxy}/org/example/lib/1.0/lib-1.0.pom"))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status(), 200);
    assert_eq!(head.headers()[header::CONTENT_LENGTH], "10");
}

#[tokio::test]
async fn hop_by_hop_headers_are_not_forwarded() {
    let (_stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let router = proxy_router(&upstream, cache.path(), |_| {});

    let request = Request::builder()
        .uri("/echo")
        .header("keep-alive", "timeout=5")
        .header("proxy-connection", "keep-alive")
        .header(header::UPGRADE, "websocket")
        .header("x-custom", "1")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = String::from_utf8(body_bytes(response).await).unwrap();
    let names: Vec<&str> = received.lines().collect();
    assert!(names.contains(&"x-custom"));
    for dropped in ["keep-alive", "proxy-connection", "upgrade"] {
        assert!(!names.contains(&dropped), "{dropped} reached upstream");
    }
}

#[tokio::test]
async fn upstream_headers_are_mirrored() {
    let (_stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    let response = reqwest::get(format!("{proxy}/echo")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-upstream"], "yes");
    let cookies: Vec<_> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .collect();
    assert_eq!(cookies, ["a=1", "b=2"]);
}

#[tokio::test]
async fn unreachable_upstream_returns_500_and_caches_nothing() {
    let cache = tempfile::tempdir().unwrap();
    let upstream = closed_upstream();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    let response = reqwest::get(format!("{proxy}/a/b.jar")).await.unwrap();
    assert_eq!(response.status(), 500);
    let message = response.text().await.unwrap();
    assert!(
        message.starts_with(&format!("Error forwarding request:{upstream}/a/b.jar,err:")),
        "unexpected message: {message}"
    );
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn concurrent_misses_fetch_once() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;
    let client = reqwest::Client::new();

    let requests = (0..8).map(|_| {
        let client = client.clone();
        let url = format!("{proxy}/slow.jar");
        async move {
            let response = client.get(url).send().await.unwrap();
            assert_eq!(response.status(), 200);
            response.bytes().await.unwrap()
        }
    });
    let bodies = futures::future::join_all(requests).await;

    for body in bodies {
        assert_eq!(body.as_ref(), jar_bytes().as_slice());
    }
    assert_eq!(stub.hits(), 1);
    assert_eq!(std::fs::read(cache.path().join("slow.jar")).unwrap(), jar_bytes());
    assert_eq!(temp_files_under(cache.path()), 0);
}

#[tokio::test]
async fn traversal_is_rejected() {
    let cache = tempfile::tempdir().unwrap();
    let router = proxy_router(&closed_upstream(), cache.path(), |_| {});

    let request = Request::builder()
        .uri("/../../etc/passwd")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn query_cannot_redirect_entry_to_another_path() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    let first = reqwest::get(format!("{proxy}/evil?/../b.jar")).await.unwrap();
    assert_eq!(first.text().await.unwrap(), "EVIL");
    assert!(!cache.path().join("b.jar").exists());

    let second = reqwest::get(format!("{proxy}/b.jar")).await.unwrap();
    assert_eq!(second.text().await.unwrap(), "GOOD");
    assert_eq!(std::fs::read(cache.path().join("b.jar")).unwrap(), b"GOOD");
    assert_eq!(stub.hits(), 2);
}

#[tokio::test]
async fn duplicate_slashes_are_not_cached_under_canonical_path() {
    let (_stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    // Even a cacheable status must not land under `org/b.jar`.
    let router = proxy_router(&upstream, cache.path(), |config| {
        config.cache.cache_error_responses = true;
    });

    let request = Request::builder()
        .uri("//org//b.jar")
        .body(Body::empty())
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    body_bytes(response).await;

    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn slow_upstream_headers_return_504() {
    let (_stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let router = proxy_router(&upstream, cache.path(), |config| {
        config.upstream.response_timeout = 0.2;
    });
    let proxy = format!("http://{}", serve(router).await);

    let response = reqwest::get(format!("{proxy}/stalled.jar")).await.unwrap();
    assert_eq!(response.status(), 504);
    let message = response.text().await.unwrap();
    assert!(
        message.contains(&format!("{upstream}/stalled.jar")),
        "unexpected message: {message}"
    );
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn encoded_bodies_are_not_cached() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    for _ in 0..2 {
        let response = reqwest::get(format!("{proxy}/encoded.jar")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()[header::CONTENT_ENCODING], "gzip");
        response.bytes().await.unwrap();
    }
    assert!(!cache.path().join("encoded.jar").exists());
    assert_eq!(stub.hits(), 2);
}

#[tokio::test]
async fn empty_body_is_committed_before_response() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    let response = reqwest::get(format!("{proxy}/empty.txt")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.bytes().await.unwrap().is_empty());
    assert_eq!(std::fs::read(cache.path().join("empty.txt")).unwrap(), b"");

    reqwest::get(format!("{proxy}/empty.txt")).await.unwrap();
    assert_eq!(stub.hits(), 1);
}

#[tokio::test]
async fn error_responses_are_not_cached_by_default() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    for _ in 0..2 {
        let response = reqwest::get(format!("{proxy}/missing.pom")).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.text().await.unwrap(), "not here");
    }
    assert!(!cache.path().join("missing.pom").exists());
    assert_eq!(stub.hits(), 2);
}

#[tokio::test]
async fn error_responses_are_cached_when_enabled() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let router = proxy_router(&upstream, cache.path(), |config| {
        config.cache.cache_error_responses = true;
    });
    let proxy = format!("http://{}", serve(router).await);

    let response = reqwest::get(format!("{proxy}/missing.pom")).await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(response.text().await.unwrap(), "not here");

    assert_eq!(
        std::fs::read(cache.path().join("missing.pom")).unwrap(),
        b"not here"
    );
    reqwest::get(format!("{proxy}/missing.pom")).await.unwrap();
    assert_eq!(stub.hits(), 1);
}

#[tokio::test]
async fn cache_directory_failure_still_serves_client() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    // A file where the `org` directory should go.
    std::fs::write(cache.path().join("org"), b"in the way").unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    for _ in 0..2 {
        let response = reqwest::get(format!("{proxy}{JAR_PATH}")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.bytes().await.unwrap().as_ref(), jar_bytes().as_slice());
    }
    assert_eq!(stub.hits(), 2);
}

#[tokio::test]
async fn non_get_requests_bypass_the_cache() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{proxy}/upload.jar"))
        .body(vec![7u8; 300])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "received 300 bytes");

    let head = client.head(format!("{proxy}{JAR_PATH}")).send().await.unwrap();
    assert_eq!(head.status(), 200);

    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
    assert_eq!(stub.hits(), 2);
}

#[tokio::test]
async fn directory_paths_are_proxied_without_caching() {
    let (stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    let response = reqwest::get(format!("{proxy}/org/example/")).await.unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
    assert_eq!(stub.hits(), 1);
}

#[tokio::test]
async fn admin_endpoints_report_state() {
    let (_stub, upstream) = spawn_stub().await;
    let cache = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(&upstream, cache.path()).await;

    reqwest::get(format!("{proxy}{JAR_PATH}"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    reqwest::get(format!("{proxy}{JAR_PATH}"))
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    let metrics = reqwest::get(format!("{proxy}/_repocache/metrics"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("repocache_requests_total{cache_status=\"Miss\"} 1"));
    assert!(metrics.contains("repocache_requests_total{cache_status=\"Hit\"} 1"));

    let health = reqwest::get(format!("{proxy}/_repocache/healthz")).await.unwrap();
    assert_eq!(health.status(), 200);
    let report: serde_json::Value = serde_json::from_str(&health.text().await.unwrap()).unwrap();
    assert_eq!(report["status"], "ok");
}
