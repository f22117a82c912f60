//! The cache engine: orchestrates the blob store and metadata index,
//! enforces the size budget, and is the single entry point
//! `diskcache-server` threads through its handlers as `Arc<Cache>` (spec.md
//! §9 "Global cache singleton" — an explicit value, never a process-wide
//! static).

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_stream::Stream;
use tracing::{info, warn};

use crate::blob::{BlobStore, StoredBlob};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::eviction::EvictionPolicy;
use crate::headers::HeaderBag;
use crate::index::{Index, NewEntry};

/// `Some(0)` on the wire means "never expires" (spec.md §9's resolution of
/// the open question about the expiry sentinel).
pub const NEVER_EXPIRE_SENTINEL: u64 = 0;

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct PutOutcome {
    pub size: u64,
    pub digest: String,
}

pub enum GetOutcome {
    Hit {
        headers: HeaderBag,
        digest: String,
        size: u64,
        expire_at: Option<f64>,
        store_time: f64,
        reader: std::pin::Pin<Box<dyn Stream<Item = std::io::Result<bytes::Bytes>> + Send>>,
    },
    NotModified {
        headers: HeaderBag,
        expire_at: Option<f64>,
    },
    Miss,
}

pub struct Cache {
    config: CacheConfig,
    blobs: BlobStore,
    index: Mutex<Index>,
}

impl Cache {
    pub fn open(config: CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;
        let db_path = config.directory.join("cache.db");
        let index = Index::open(&db_path, 64 * 1024 * 1024)?;
        let blobs = BlobStore::new(config.directory.clone());

        // Boot-time consistency pass (spec.md §7): delete blob files not
        // referenced by any row.
        let referenced = index.referenced_filenames()?;
        let removed = blobs.sweep_orphans(&referenced);
        if removed > 0 {
            info!(removed, "removed orphaned blob files at startup");
        }

        Ok(Self {
            config,
            blobs,
            index: Mutex::new(index),
        })
    }

    pub fn directory(&self) -> &PathBuf {
        &self.config.directory
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Flush the WAL and close cleanly.
    pub fn close(self) -> Result<()> {
        self.index.into_inner().expect("index mutex poisoned").close()
    }

    pub async fn put<S, E>(
        &self,
        key: &[u8],
        stream: S,
        expire_after_secs: Option<u64>,
        declared_length: Option<u64>,
        header_hints: HeaderBag,
    ) -> Result<PutOutcome>
    where
        S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let stored = self
            .blobs
            .store(
                stream,
                key,
                declared_length,
                self.config.inline_threshold,
                self.config.value_size_limit,
            )
            .await?;

        let put_result = self.commit_put(key, &stored, expire_after_secs, header_hints);

        if let Err(ref e) = put_result {
            // Step 6 of spec.md §4.C: on failure after blob-store.store
            // succeeded, the partial blob must be unlinked.
            if let Some(filename) = &stored.filename {
                self.blobs.unlink(filename).await;
            }
            warn!(error = %e, "put failed after blob was staged; cleaned up");
        }

        put_result
    }

    fn commit_put(
        &self,
        key: &[u8],
        stored: &StoredBlob,
        expire_after_secs: Option<u64>,
        header_hints: HeaderBag,
    ) -> Result<PutOutcome> {
        let now = now_secs();
        let expire_time = resolve_expiry(expire_after_secs, self.config.default_expire.as_secs(), now);

        let new_entry = NewEntry {
            key,
            store_time: now,
            expire_time,
            headers: &header_hints,
            digest: &stored.digest,
            size: stored.size,
            mode: stored.mode,
            filename: stored.filename.as_deref(),
            inline_bytes: stored.inline_bytes.as_deref(),
        };

        let outcome = {
            let mut index = self.index.lock().expect("index mutex poisoned");
            index.upsert(
                new_entry,
                self.config.eviction_policy,
                self.config.size_limit,
                self.config.cull_limit,
                now,
            )?
        };

        // Post-commit side effects: unlink the file this key used to point
        // at (if any, and if it differs from the file we just wrote) and
        // every file the eviction sweep dropped.
        if let Some(old_filename) = &outcome.replaced_filename {
            if Some(old_filename.as_str()) != stored.filename.as_deref() {
                self.unlink_blocking(old_filename);
            }
        }
        for filename in &outcome.evicted_filenames {
            self.unlink_blocking(filename);
        }

        Ok(PutOutcome {
            size: stored.size,
            digest: stored.digest.clone(),
        })
    }

    /// Unlinks a file outside of the index's critical section. `commit_put`
    /// is synchronous (the index mutex is a plain `std::sync::Mutex`), so
    /// this runs after the lock is already released rather than needing to
    /// be spawned off of it.
    fn unlink_blocking(&self, filename: &str) {
        let path = self.blobs.root().join(filename);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to unlink blob file");
            }
        }
    }

    pub fn get(&self, key: &[u8], if_none_match: Option<&str>) -> Result<GetOutcome> {
        let now = now_secs();
        let entry = {
            let index = self.index.lock().expect("index mutex poisoned");
            index.lookup(key, now)?
        };

        let Some(entry) = entry else {
            return Ok(GetOutcome::Miss);
        };

        if if_none_match == Some(entry.digest.as_str()) {
            return Ok(GetOutcome::NotModified {
                headers: entry.headers,
                expire_at: entry.expire_time,
            });
        }

        let reader = self
            .blobs
            .open_reader(entry.mode, entry.filename.as_deref(), entry.inline_bytes)?;

        {
            let index = self.index.lock().expect("index mutex poisoned");
            if let Err(e) = index.record_access(key, now) {
                warn!(error = %e, "failed to record access bookkeeping");
            }
        }

        Ok(GetOutcome::Hit {
            headers: entry.headers,
            digest: entry.digest,
            size: entry.size,
            expire_at: entry.expire_time,
            store_time: entry.store_time,
            reader: Box::pin(reader),
        })
    }

    pub async fn delete(&self, key: &[u8]) -> Result<bool> {
        let outcome = {
            let mut index = self.index.lock().expect("index mutex poisoned");
            index.delete(key)?
        };
        if let Some(filename) = &outcome.filename {
            self.blobs.unlink(filename).await;
        }
        Ok(outcome.existed)
    }

    pub async fn clear(&self) -> Result<usize> {
        let (removed, filenames) = {
            let mut index = self.index.lock().expect("index mutex poisoned");
            index.clear()?
        };
        for filename in &filenames {
            self.blobs.unlink(filename).await;
        }
        Ok(removed)
    }

    pub fn volume(&self) -> Result<u64> {
        self.index.lock().expect("index mutex poisoned").size()
    }

    pub fn len(&self) -> Result<u64> {
        self.index.lock().expect("index mutex poisoned").count()
    }
}

/// Resolves the TTL header value into a concrete `expire_time`, applying
/// the never-expire sentinel (spec.md §9: `x-diskcache-expire: 0` → never).
fn resolve_expiry(expire_after_secs: Option<u64>, default_expire_secs: u64, now: f64) -> Option<f64> {
    match expire_after_secs {
        Some(NEVER_EXPIRE_SENTINEL) => None,
        Some(secs) => Some(now + secs as f64),
        None => Some(now + default_expire_secs as f64),
    }
}
