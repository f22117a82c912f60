//! The indexed, size-bounded, eviction-driven cache engine.
//!
//! This crate has no HTTP in it; `diskcache-server` is the facade that
//! drives [`engine::Cache`] from axum handlers.

pub mod blob;
pub mod config;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod headers;
pub mod index;

pub use config::CacheConfig;
pub use engine::{Cache, GetOutcome, PutOutcome};
pub use error::{CacheError, Result};
pub use eviction::EvictionPolicy;
pub use headers::HeaderBag;
