//! The `-/` reserved-prefix endpoints: cache-wide operations and
//! observability, never touching an individual data key.

use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use flate2::write::GzEncoder;
use flate2::Compression;
use prometheus::{Encoder, TextEncoder};
use tokio_stream::StreamExt;
use tracing::warn;

use crate::respond::plain;
use crate::state::AppState;

pub async fn flushall(State(state): State<Arc<AppState>>) -> Response {
    match state.cache.clear().await {
        Ok(removed) => {
            (StatusCode::OK, format!("cleared {removed} entries\n")).into_response()
        }
        Err(e) => {
            warn!(error = %e, "flushall failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "flushall failed")
        }
    }
}

/// Exercises a full put/get/delete cycle against a throwaway key so the
/// healthcheck proves the engine actually works end to end, not just that
/// the process is alive.
pub async fn healthcheck(State(state): State<Arc<AppState>>) -> Response {
    let key = format!("-/healthcheck/{}", uuid::Uuid::new_v4());
    let body = tokio_stream::once(Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"ok")));

    if let Err(e) = state
        .cache
        .put(key.as_bytes(), body, Some(60), Some(2), Default::default())
        .await
    {
        warn!(error = %e, "healthcheck put failed");
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "healthcheck failed");
    }

    let got = match state.cache.get(key.as_bytes(), None) {
        Ok(diskcache_core::GetOutcome::Hit { mut reader, .. }) => {
            let mut buf = Vec::new();
            while let Some(chunk) = reader.next().await {
                match chunk {
                    Ok(c) => buf.extend_from_slice(&c),
                    Err(e) => {
                        warn!(error = %e, "healthcheck read failed");
                        return plain(StatusCode::INTERNAL_SERVER_ERROR, "healthcheck failed");
                    }
                }
            }
            buf
        }
        _ => return plain(StatusCode::INTERNAL_SERVER_ERROR, "healthcheck failed"),
    };

    let _ = state.cache.delete(key.as_bytes()).await;

    if got == b"ok" {
        plain(StatusCode::OK, "ok")
    } else {
        plain(StatusCode::INTERNAL_SERVER_ERROR, "healthcheck failed")
    }
}

pub async fn metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    state
        .metrics
        .cache_len
        .set(state.cache.len().unwrap_or(0) as i64);
    state
        .metrics
        .cache_volume
        .set(state.cache.volume().unwrap_or(0) as i64);

    let metric_families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metric_families, &mut buf) {
        warn!(error = %e, "failed to encode metrics");
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed");
    }

    let accepts_gzip = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);

    if accepts_gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&buf).is_ok() {
            if let Ok(gzipped) = encoder.finish() {
                return Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                    .header(header::CONTENT_ENCODING, "gzip")
                    .body(Body::from(gzipped))
                    .unwrap();
            }
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(buf))
        .unwrap()
}

/// Non-mutating diagnostic snapshot, only routed when `DEBUG=True` (spec.md
/// §6's `DEBUG` variable). Not part of the tested invariants in spec.md §8.
pub async fn debug_pprof(State(state): State<Arc<AppState>>) -> Response {
    let body = serde_json::json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "cache_len": state.cache.len().unwrap_or(0),
        "cache_volume": state.cache.volume().unwrap_or(0),
        "size_limit": state.cache.config().size_limit,
        "eviction_policy": state.cache.config().eviction_policy.to_string(),
    });
    (StatusCode::OK, axum::Json(body)).into_response()
}
