//! Router-level tests driven through `tower::ServiceExt::oneshot` rather
//! than a bound TCP listener, exercising the same scenarios spec.md §8
//! calls out.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use diskcache_core::{Cache, CacheConfig};
use diskcache_server::routes::build_router;
use diskcache_server::state::AppState;
use http_body_util::BodyExt;
use tower::ServiceExt;

fn test_app() -> (tempfile::TempDir, axum::Router) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CacheConfig::default();
    config.directory = dir.path().to_path_buf();
    config.size_limit = 1 << 20;
    let cache = Arc::new(Cache::open(config).unwrap());
    let state = Arc::new(AppState::new(cache).unwrap());
    (dir, build_router(state))
}

async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    resp.into_body().collect().await.unwrap().to_bytes().to_vec()
}

#[tokio::test]
async fn round_trips_a_basic_put_and_get() {
    let (_dir, app) = test_app();

    let put = Request::builder()
        .method("PUT")
        .uri("/data")
        .header("content-length", "11")
        .body(Body::from("hello world"))
        .unwrap();
    let resp = app.clone().oneshot(put).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let get = Request::builder().uri("/data").body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(get).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let etag = resp
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(
        etag,
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
    assert_eq!(resp.headers().get("content-length").unwrap(), "11");
    assert_eq!(body_bytes(resp).await, b"hello world");
}

#[tokio::test]
async fn conditional_get_returns_304() {
    let (_dir, app) = test_app();

    let put = Request::builder()
        .method("PUT")
        .uri("/data")
        .header("content-length", "11")
        .body(Body::from("hello world"))
        .unwrap();
    app.clone().oneshot(put).await.unwrap();

    let get = Request::builder().uri("/data").body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(get).await.unwrap();
    let etag = resp.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let conditional = Request::builder()
        .uri("/data")
        .header("if-none-match", etag)
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(conditional).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn header_passthrough_round_trips() {
    let (_dir, app) = test_app();

    let put = Request::builder()
        .method("PUT")
        .uri("/doc")
        .header("content-length", "5")
        .header("content-type", "text/plain")
        .header("content-encoding", "gzip")
        .header("x-set-cache-control", "public, must-revalidate")
        .body(Body::from("hello"))
        .unwrap();
    let resp = app.clone().oneshot(put).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let get = Request::builder().uri("/doc").body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(get).await.unwrap();
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    assert_eq!(resp.headers().get("content-encoding").unwrap(), "gzip");
    assert_eq!(
        resp.headers().get("cache-control").unwrap(),
        "public, must-revalidate"
    );
}

#[tokio::test]
async fn missing_key_is_404() {
    let (_dir, app) = test_app();
    let get = Request::builder().uri("/nope").body(Body::empty()).unwrap();
    let resp = app.oneshot(get).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_then_get_is_404() {
    let (_dir, app) = test_app();

    let put = Request::builder()
        .method("PUT")
        .uri("/data")
        .header("content-length", "5")
        .body(Body::from("hello"))
        .unwrap();
    app.clone().oneshot(put).await.unwrap();

    let del = Request::builder()
        .method("DELETE")
        .uri("/data")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(del).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let get = Request::builder().uri("/data").body(Body::empty()).unwrap();
    let resp = app.oneshot(get).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reserved_prefix_rejects_put_and_delete() {
    let (_dir, app) = test_app();

    let put = Request::builder()
        .method("PUT")
        .uri("/-/sneaky")
        .body(Body::from("x"))
        .unwrap();
    let resp = app.clone().oneshot(put).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let del = Request::builder()
        .method("DELETE")
        .uri("/-/sneaky")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(del).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_put_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CacheConfig::default();
    config.directory = dir.path().to_path_buf();
    config.value_size_limit = 4;
    let cache = Arc::new(Cache::open(config).unwrap());
    let state = Arc::new(AppState::new(cache).unwrap());
    let app = build_router(state);

    let put = Request::builder()
        .method("PUT")
        .uri("/toobig")
        .header("content-length", "11")
        .body(Body::from("hello world"))
        .unwrap();
    let resp = app.clone().oneshot(put).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let get = Request::builder().uri("/toobig").body(Body::empty()).unwrap();
    let resp = app.oneshot(get).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthcheck_and_metrics_and_flushall() {
    let (_dir, app) = test_app();

    let hc = Request::builder()
        .uri("/-/healthcheck/")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(hc).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let put = Request::builder()
        .method("PUT")
        .uri("/data")
        .header("content-length", "5")
        .body(Body::from("hello"))
        .unwrap();
    app.clone().oneshot(put).await.unwrap();

    let metrics = Request::builder()
        .uri("/-/metrics/")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(metrics).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(resp).await).unwrap();
    assert!(text.contains("cache_len"));
    assert!(text.contains("cache_volume"));

    let flush = Request::builder()
        .method("POST")
        .uri("/-/flushall/")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(flush).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let get = Request::builder().uri("/data").body(Body::empty()).unwrap();
    let resp = app.oneshot(get).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
