//! Maps [`diskcache_core::CacheError`] onto the status codes and bodies
//! spec'd for the HTTP facade (§4.E / §7 of the cache-engine design).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use diskcache_core::CacheError;
use tracing::warn;

pub fn error_response(err: &CacheError) -> Response {
    let (status, body) = match err {
        CacheError::SizeLimitExceeded => (StatusCode::BAD_REQUEST, "size limit exceeded"),
        CacheError::SizeMismatch => (StatusCode::BAD_REQUEST, "content-length different"),
        CacheError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "invalid key"),
        CacheError::NotFound(_) => (StatusCode::NOT_FOUND, "not found"),
        CacheError::Timeout => (StatusCode::SERVICE_UNAVAILABLE, "ingest timed out"),
        CacheError::Corrupt(_) | CacheError::Storage(_) | CacheError::Io(_) => {
            warn!(error = %err, "storage fault");
            (StatusCode::INTERNAL_SERVER_ERROR, "storage error")
        }
    };
    (status, body).into_response()
}

pub fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}
