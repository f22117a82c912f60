//! Eviction policy: which column orders victim selection.
//!
//! Mirrors `mosaicfs-vfs::cache::FileCache::evict_lru`'s
//! `ORDER BY last_access ASC LIMIT 1` query, generalized to the three
//! orderings spec.md names and to a victim budget per call instead of an
//! unbounded loop.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least-recently-stored: order by `store_time` ascending.
    Lrs,
    /// Least-recently-used: order by `access_time` ascending.
    Lru,
    /// Least-frequently-used: order by `access_count` ascending, ties by `access_time`.
    Lfu,
}

impl EvictionPolicy {
    /// The `ORDER BY` clause fragment used by `Index::scan_for_victims`.
    /// All three end with `rowid ASC` so insertion order breaks remaining ties.
    pub fn order_by(self) -> &'static str {
        match self {
            EvictionPolicy::Lrs => "store_time ASC, rowid ASC",
            EvictionPolicy::Lru => "access_time ASC, rowid ASC",
            EvictionPolicy::Lfu => "access_count ASC, access_time ASC, rowid ASC",
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least-recently-stored" => Ok(EvictionPolicy::Lrs),
            "least-recently-used" => Ok(EvictionPolicy::Lru),
            "least-frequently-used" => Ok(EvictionPolicy::Lfu),
            other => Err(format!("unrecognized eviction policy: {other}")),
        }
    }
}

impl std::fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvictionPolicy::Lrs => "least-recently-stored",
            EvictionPolicy::Lru => "least-recently-used",
            EvictionPolicy::Lfu => "least-frequently-used",
        };
        f.write_str(s)
    }
}
