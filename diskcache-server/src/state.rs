//! Shared application state threaded through every handler.

use std::sync::Arc;
use std::time::Instant;

use diskcache_core::Cache;
use prometheus::{IntCounter, IntGauge, Registry};

/// The Prometheus collectors exposed at `/-/metrics/`. Registered once at
/// boot; `cache_len`/`cache_volume` are set from the engine's own accessors
/// just before each scrape rather than tracked incrementally, since the
/// engine already knows its row count and volume exactly.
pub struct Metrics {
    pub registry: Registry,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_len: IntGauge,
    pub cache_volume: IntGauge,
}

impl Metrics {
    fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let cache_hits = IntCounter::new("cache_hits", "successful GET hits")?;
        let cache_misses = IntCounter::new("cache_misses", "GET misses (absent or expired key)")?;
        let cache_len = IntGauge::new("cache_len", "number of live entries")?;
        let cache_volume = IntGauge::new("cache_volume", "bytes occupied by live entries")?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_len.clone()))?;
        registry.register(Box::new(cache_volume.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            cache_len,
            cache_volume,
        })
    }
}

pub struct AppState {
    pub cache: Arc<Cache>,
    pub metrics: Metrics,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(cache: Arc<Cache>) -> anyhow::Result<Self> {
        Ok(Self {
            cache,
            metrics: Metrics::new()?,
            started_at: Instant::now(),
        })
    }
}
