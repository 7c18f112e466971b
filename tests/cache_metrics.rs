use std::collections::HashSet;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header::HOST},
    middleware,
    response::Html,
    routing::get,
};
use metrics_util::debugging::DebuggingRecorder;
use pagecache::cache::{CacheConfig, CacheState, PageCache, RateLimitConfig, page_cache_layer};
use tower::ServiceExt;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let dir = tempfile::tempdir().expect("tempdir");
    let blocker = dir.path().join("blocked");
    tokio::fs::write(&blocker, b"not a directory")
        .await
        .expect("blocker file");

    let state = CacheState::new(
        PageCache::new(CacheConfig {
            root: dir.path().join("cache"),
            ignore_paths: vec!["/contact-us/".to_string()],
            ..Default::default()
        }),
        RateLimitConfig {
            enabled: true,
            window_seconds: 60,
            max_requests: 3,
        },
    );
    let app = Router::new()
        .route("/blog/{slug}", get(|| async { Html("<html>post</html>") }))
        .route("/contact-us/", get(|| async { Html("<html>form</html>") }))
        .layer(middleware::from_fn_with_state(state, page_cache_layer));

    // miss, hit, bypass, rate limited
    let mut statuses = Vec::new();
    for uri in ["/blog/one", "/blog/one", "/contact-us/", "/blog/two"] {
        statuses.push(send(&app, uri).await);
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS
        ]
    );

    // store failure: the cache root sits below a regular file
    let failing = CacheState::new(
        PageCache::new(CacheConfig {
            root: blocker.join("cache"),
            ..Default::default()
        }),
        RateLimitConfig::default(),
    );
    let failing_app = Router::new()
        .route("/blog/{slug}", get(|| async { Html("<html>post</html>") }))
        .layer(middleware::from_fn_with_state(failing, page_cache_layer));
    assert_eq!(send(&failing_app, "/blog/three").await, StatusCode::OK);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "pagecache_hit_total",
        "pagecache_miss_total",
        "pagecache_bypass_total",
        "pagecache_store_failed_total",
        "pagecache_rate_limited_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

async fn send(app: &Router, uri: &str) -> StatusCode {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(HOST, "example.com")
        .header("x-forwarded-proto", "https")
        .header("x-forwarded-for", "192.0.2.10")
        .body(Body::empty())
        .expect("request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
        .status()
}
