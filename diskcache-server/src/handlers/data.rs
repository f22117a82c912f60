//! `PUT`/`GET`/`DELETE` on a data key — the only routes that touch the
//! cache engine. Everything under the `-/` reserved prefix lives in
//! [`crate::handlers::management`] instead.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use diskcache_core::{GetOutcome, HeaderBag};
use tracing::warn;

use crate::respond::{error_response, plain};
use crate::state::AppState;

fn is_reserved(name: &str) -> bool {
    name.starts_with("-/")
}

fn http_date(secs: f64) -> String {
    let time = UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0));
    httpdate::fmt_http_date(time)
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers.get(name)?.to_str().ok().map(|s| s.to_string())
}

pub async fn put(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if is_reserved(&name) {
        return plain(StatusCode::BAD_REQUEST, "reserved path");
    }

    let declared_length = match headers.get(header::CONTENT_LENGTH) {
        Some(v) => match v.to_str().ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(n) => Some(n),
            None => return plain(StatusCode::BAD_REQUEST, "invalid content-length"),
        },
        None => None,
    };

    let expire_after = match headers.get("x-diskcache-expire") {
        Some(v) => match v.to_str().ok().and_then(|s| s.parse::<u64>().ok()) {
            Some(n) => Some(n),
            None => return plain(StatusCode::BAD_REQUEST, "invalid x-diskcache-expire"),
        },
        None => None,
    };

    let header_hints = HeaderBag {
        content_type: header_str(&headers, header::CONTENT_TYPE),
        content_encoding: header_str(&headers, header::CONTENT_ENCODING),
        cache_control: headers
            .get("x-set-cache-control")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        passthrough: Default::default(),
    };

    let stream = body.into_data_stream();
    let fut = state.cache.put(
        name.as_bytes(),
        stream,
        expire_after,
        declared_length,
        header_hints,
    );

    let outcome = match tokio::time::timeout(state.cache.config().put_timeout, fut).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => return error_response(&e),
        Err(_) => {
            warn!(key = %name, "put timed out");
            return plain(StatusCode::SERVICE_UNAVAILABLE, "ingest timed out");
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::ETAG, outcome.digest)
        .header(header::CONTENT_LENGTH, outcome.size.to_string())
        .body(Body::empty())
        .unwrap()
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if is_reserved(&name) {
        return plain(StatusCode::BAD_REQUEST, "reserved path");
    }

    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('"'));

    let outcome = match state.cache.get(name.as_bytes(), if_none_match) {
        Ok(o) => o,
        Err(e) => return error_response(&e),
    };

    match outcome {
        GetOutcome::Miss => {
            state.metrics.cache_misses.inc();
            plain(StatusCode::NOT_FOUND, "not found")
        }
        GetOutcome::NotModified { headers: bag, expire_at } => {
            state.metrics.cache_hits.inc();
            let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
            builder = apply_header_bag(builder, &bag);
            if let Some(expire_at) = expire_at {
                builder = builder.header("Expire", http_date(expire_at));
            }
            builder.body(Body::empty()).unwrap()
        }
        GetOutcome::Hit {
            headers: bag,
            digest,
            size,
            expire_at,
            store_time,
            reader,
        } => {
            state.metrics.cache_hits.inc();
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size.to_string())
                .header(header::ETAG, digest)
                .header(header::LAST_MODIFIED, http_date(store_time));
            builder = apply_header_bag(builder, &bag);
            if let Some(expire_at) = expire_at {
                builder = builder.header("Expire", http_date(expire_at));
            }
            builder.body(Body::from_stream(reader)).unwrap()
        }
    }
}

fn apply_header_bag(mut builder: axum::http::response::Builder, bag: &HeaderBag) -> axum::http::response::Builder {
    if let Some(ct) = &bag.content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    if let Some(ce) = &bag.content_encoding {
        builder = builder.header(header::CONTENT_ENCODING, ce);
    }
    if let Some(cc) = &bag.cache_control {
        builder = builder.header(header::CACHE_CONTROL, cc);
    }
    builder
}

pub async fn delete(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    if is_reserved(&name) {
        return plain(StatusCode::BAD_REQUEST, "reserved path");
    }

    match state.cache.delete(name.as_bytes()).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => plain(StatusCode::NOT_FOUND, "not found"),
        Err(e) => error_response(&e),
    }
}
