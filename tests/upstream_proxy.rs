//! The full router against a live upstream on a loopback port.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{
        HeaderMap, Request, StatusCode,
        header::{ACCEPT_ENCODING, CONTENT_ENCODING, HOST},
    },
    response::{Html, IntoResponse},
    routing::get,
};
use pagecache::{
    cache::{CACHE_STATUS_HEADER, CacheConfig, CacheState, PageCache, RateLimitConfig},
    config::OriginSettings,
    infra::{
        http::{HEALTH_PATH, build_router},
        upstream::{SKIP_CACHE_HEADER, UpstreamOrigin},
    },
};
use http_body_util::BodyExt;
use tokio::net::TcpListener;
use tower::ServiceExt;
use url::Url;

async fn spawn_upstream(calls: Arc<AtomicUsize>) -> Url {
    let page_calls = Arc::clone(&calls);
    let cart_calls = Arc::clone(&calls);
    let upstream = Router::new()
        .route(
            "/blog/{slug}",
            get(move || {
                let calls = Arc::clone(&page_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Html("<html><body>from upstream</body></html>")
                }
            }),
        )
        .route(
            "/cart",
            get(move || {
                let calls = Arc::clone(&cart_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    (
                        [(SKIP_CACHE_HEADER, "1")],
                        Html("<html><body>cart</body></html>"),
                    )
                        .into_response()
                }
            }),
        )
        .route(
            "/article",
            get(|headers: HeaderMap| async move {
                if headers.contains_key(ACCEPT_ENCODING) {
                    (
                        [(CONTENT_ENCODING, "gzip")],
                        vec![0x1f_u8, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00],
                    )
                        .into_response()
                } else {
                    Html("<html><body>article</body></html>").into_response()
                }
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.expect("upstream");
    });
    Url::parse(&format!("http://{addr}")).expect("url")
}

async fn router(dir: &tempfile::TempDir, calls: Arc<AtomicUsize>) -> Router {
    let base = spawn_upstream(calls).await;
    let origin = UpstreamOrigin::new(&OriginSettings {
        upstream_url: Some(base),
        timeout: Duration::from_secs(5),
    })
    .expect("origin");
    let state = CacheState::new(
        PageCache::new(CacheConfig {
            root: dir.path().join("cache"),
            ..Default::default()
        }),
        RateLimitConfig::default(),
    );
    build_router(state, Arc::new(origin))
}

fn secure(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(HOST, "example.com")
        .header("x-forwarded-proto", "https")
        .body(Body::empty())
        .expect("request should build")
}

fn label(response: &axum::response::Response) -> Option<&str> {
    response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn upstream_pages_are_cached() {
    let dir = tempfile::tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let app = router(&dir, Arc::clone(&calls)).await;

    let first = app.clone().oneshot(secure("/blog/a")).await.expect("respond");
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(label(&first), Some("miss"));

    let second = app.clone().oneshot(secure("/blog/a")).await.expect("respond");
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(label(&second), Some("hit"));

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn browser_encodings_are_not_forwarded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = router(&dir, Arc::new(AtomicUsize::new(0))).await;

    for expected in ["miss", "hit"] {
        let mut request = secure("/article");
        request
            .headers_mut()
            .insert(ACCEPT_ENCODING, "gzip, br".parse().expect("header"));
        let response = app.clone().oneshot(request).await.expect("respond");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(label(&response), Some(expected));
        assert!(response.headers().get(CONTENT_ENCODING).is_none());

        let body = response
            .into_body()
            .collect()
            .await
            .expect("body should collect")
            .to_bytes();
        assert_eq!(&body[..], b"<html><body>article</body></html>");
    }
}

#[tokio::test]
async fn upstream_skip_header_prevents_storage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let calls = Arc::new(AtomicUsize::new(0));
    let app = router(&dir, Arc::clone(&calls)).await;

    for _ in 0..2 {
        let response = app.clone().oneshot(secure("/cart")).await.expect("respond");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(label(&response), Some("miss"));
        assert!(response.headers().get(SKIP_CACHE_HEADER).is_none());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unknown_upstream_paths_pass_through() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = router(&dir, Arc::new(AtomicUsize::new(0))).await;

    let response = app.clone().oneshot(secure("/nowhere")).await.expect("respond");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(label(&response), Some("miss"));
}

#[tokio::test]
async fn health_probe_skips_the_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let app = router(&dir, Arc::new(AtomicUsize::new(0))).await;

    let request = Request::builder()
        .uri(HEALTH_PATH)
        .body(Body::empty())
        .expect("request should build");
    let response = app.oneshot(request).await.expect("respond");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(label(&response).is_none());
}

#[tokio::test]
async fn unreachable_upstream_is_a_bad_gateway() {
    let dir = tempfile::tempdir().expect("tempdir");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let origin = UpstreamOrigin::new(&OriginSettings {
        upstream_url: Some(Url::parse(&format!("http://{addr}")).expect("url")),
        timeout: Duration::from_secs(2),
    })
    .expect("origin");
    let state = CacheState::new(
        PageCache::new(CacheConfig {
            root: dir.path().join("cache"),
            ..Default::default()
        }),
        RateLimitConfig::default(),
    );
    let app = build_router(state, Arc::new(origin));

    let response = app.oneshot(secure("/blog/a")).await.expect("respond");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
