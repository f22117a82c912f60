use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("value exceeds the configured size limit")]
    SizeLimitExceeded,
    #[error("declared content length does not match the received body")]
    SizeMismatch,
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("ingest timed out")]
    Timeout,
    #[error("index row is inconsistent: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;
