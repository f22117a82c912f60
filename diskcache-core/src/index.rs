//! The durable metadata index: one SQLite table, WAL-enabled, one writer.
//!
//! Grounded on `mosaicfs-vfs::cache::FileCache`: a thin wrapper around a
//! single `rusqlite::Connection`, `CREATE TABLE IF NOT EXISTS` run through
//! `execute_batch` at `open()`, and an `ORDER BY ... LIMIT 1` query for
//! victim selection — generalized here to three orderings and transactional
//! eviction instead of an unbounded post-hoc loop.

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use crate::blob::StorageMode;
use crate::error::{CacheError, Result};
use crate::eviction::EvictionPolicy;
use crate::headers::HeaderBag;

/// One row of the `Cache` table, decoded into Rust types.
#[derive(Debug, Clone)]
pub struct Entry {
    pub rowid: i64,
    pub key: Vec<u8>,
    pub store_time: f64,
    pub expire_time: Option<f64>,
    pub access_time: f64,
    pub access_count: i64,
    pub headers: HeaderBag,
    pub digest: String,
    pub size: u64,
    pub mode: StorageMode,
    pub filename: Option<String>,
    pub inline_bytes: Option<Vec<u8>>,
}

/// The fields supplied by the cache engine when it writes a new value.
pub struct NewEntry<'a> {
    pub key: &'a [u8],
    pub store_time: f64,
    pub expire_time: Option<f64>,
    pub headers: &'a HeaderBag,
    pub digest: &'a str,
    pub size: u64,
    pub mode: StorageMode,
    pub filename: Option<&'a str>,
    pub inline_bytes: Option<&'a [u8]>,
}

/// Outcome of an `upsert`: the filename of any prior row under the same
/// key, to be unlinked by the caller once the blob store is free of the
/// index's write lock (spec.md §5).
pub struct UpsertOutcome {
    pub replaced_filename: Option<String>,
    /// Filenames of rows evicted by the in-transaction eviction sweep.
    pub evicted_filenames: Vec<String>,
}

/// Outcome of a `delete`: whether a row existed, and the filename to unlink.
pub struct DeleteOutcome {
    pub existed: bool,
    pub filename: Option<String>,
}

pub struct Index {
    conn: Connection,
}

const MODE_INLINE: i64 = 0;
const MODE_FILE: i64 = 1;

fn mode_to_i64(mode: StorageMode) -> i64 {
    match mode {
        StorageMode::Inline => MODE_INLINE,
        StorageMode::File => MODE_FILE,
    }
}

fn mode_from_i64(v: i64) -> Result<StorageMode> {
    match v {
        MODE_INLINE => Ok(StorageMode::Inline),
        MODE_FILE => Ok(StorageMode::File),
        other => Err(CacheError::Corrupt(format!("unrecognized mode column value: {other}"))),
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<(Entry, i64)> {
    let tag: Vec<u8> = row.get("tag")?;
    let mode_raw: i64 = row.get("mode")?;
    Ok((
        Entry {
            rowid: row.get("rowid")?,
            key: row.get("key")?,
            store_time: row.get("store_time")?,
            expire_time: row.get("expire_time")?,
            access_time: row.get("access_time")?,
            access_count: row.get("access_count")?,
            headers: HeaderBag::from_bytes(&tag).unwrap_or_default(),
            digest: row.get("digest")?,
            size: {
                let n: i64 = row.get("size")?;
                n as u64
            },
            mode: StorageMode::Inline, // patched below once we can return errors
            filename: row.get("filename")?,
            inline_bytes: row.get("value")?,
        },
        mode_raw,
    ))
}

impl Index {
    pub fn open(path: &Path, mmap_size: i64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA auto_vacuum=FULL;
             PRAGMA mmap_size={mmap_size};
             CREATE TABLE IF NOT EXISTS Cache (
                 rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                 key BLOB NOT NULL UNIQUE,
                 raw INTEGER NOT NULL DEFAULT 0,
                 store_time REAL NOT NULL,
                 expire_time REAL,
                 access_time REAL NOT NULL,
                 access_count INTEGER NOT NULL DEFAULT 0,
                 tag BLOB NOT NULL,
                 digest TEXT NOT NULL,
                 size INTEGER NOT NULL,
                 mode INTEGER NOT NULL,
                 filename TEXT,
                 value BLOB
             );
             CREATE INDEX IF NOT EXISTS idx_cache_expire ON Cache(expire_time);
             CREATE INDEX IF NOT EXISTS idx_cache_store_time ON Cache(store_time);
             CREATE INDEX IF NOT EXISTS idx_cache_access_time ON Cache(access_time);
             CREATE INDEX IF NOT EXISTS idx_cache_access_count ON Cache(access_count);"
        ))?;
        Ok(Self { conn })
    }

    /// All filenames currently referenced by a row, for the boot-time
    /// orphan sweep (spec.md §7).
    pub fn referenced_filenames(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT filename FROM Cache WHERE filename IS NOT NULL")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(rows)
    }

    fn decode_row(row: &rusqlite::Row) -> rusqlite::Result<Entry> {
        let (mut entry, mode_raw) = row_to_entry(row)?;
        entry.mode = mode_from_i64(mode_raw).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Integer,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad mode")),
            )
        })?;
        Ok(entry)
    }

    /// Look up the current row for `key`. Treats `expire_time <= now` as
    /// absent and deletes the row so the read also self-culls it.
    pub fn lookup(&self, key: &[u8], now: f64) -> Result<Option<Entry>> {
        let entry = self
            .conn
            .query_row(
                "SELECT rowid, key, store_time, expire_time, access_time, access_count, tag, digest, size, mode, filename, value
                 FROM Cache WHERE key = ?1",
                params![key],
                Self::decode_row,
            )
            .optional()?;

        let Some(entry) = entry else {
            return Ok(None);
        };

        if let Some(expire) = entry.expire_time {
            if expire <= now {
                // Lazily cull: remove the row (the caller unlinks the file).
                self.conn
                    .execute("DELETE FROM Cache WHERE rowid = ?1", params![entry.rowid])?;
                return Ok(None);
            }
        }
        Ok(Some(entry))
    }

    /// Bump `access_time`/`access_count` for `key`. Safe to call lazily or
    /// in a batch; loss on crash is acceptable per spec.md §5.
    pub fn record_access(&self, key: &[u8], now: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE Cache SET access_time = ?1, access_count = access_count + 1 WHERE key = ?2",
            params![now, key],
        )?;
        Ok(())
    }

    /// Insert or replace the row for `entry.key`, then run the eviction
    /// sweep inside the same transaction (spec.md §4.B, §4.D).
    pub fn upsert(
        &mut self,
        entry: NewEntry<'_>,
        policy: EvictionPolicy,
        size_limit: u64,
        cull_limit: u32,
        now: f64,
    ) -> Result<UpsertOutcome> {
        let tx = self.conn.transaction()?;

        let replaced_filename: Option<String> = tx
            .query_row(
                "SELECT filename FROM Cache WHERE key = ?1",
                params![entry.key],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        tx.execute(
            "INSERT INTO Cache
                 (key, raw, store_time, expire_time, access_time, access_count, tag, digest, size, mode, filename, value)
             VALUES (?1, 0, ?2, ?3, ?2, 0, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET
                 store_time = excluded.store_time,
                 expire_time = excluded.expire_time,
                 access_time = excluded.access_time,
                 access_count = 0,
                 tag = excluded.tag,
                 digest = excluded.digest,
                 size = excluded.size,
                 mode = excluded.mode,
                 filename = excluded.filename,
                 value = excluded.value",
            params![
                entry.key,
                entry.store_time,
                entry.expire_time,
                entry.headers.to_bytes(),
                entry.digest,
                entry.size as i64,
                mode_to_i64(entry.mode),
                entry.filename,
                entry.inline_bytes,
            ],
        )?;

        let evicted_filenames = run_eviction_sweep(&tx, policy, size_limit, cull_limit, now)?;

        tx.commit()?;
        Ok(UpsertOutcome {
            replaced_filename,
            evicted_filenames,
        })
    }

    /// Remove the row for `key`.
    pub fn delete(&mut self, key: &[u8]) -> Result<DeleteOutcome> {
        let tx = self.conn.transaction()?;
        let filename: Option<String> = tx
            .query_row(
                "SELECT filename FROM Cache WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let changed = tx.execute("DELETE FROM Cache WHERE key = ?1", params![key])?;
        tx.commit()?;
        Ok(DeleteOutcome {
            existed: changed > 0,
            filename,
        })
    }

    /// Drop every row. Returns the filenames to unlink and the row count removed.
    pub fn clear(&mut self) -> Result<(usize, Vec<String>)> {
        let tx = self.conn.transaction()?;
        let filenames: Vec<String> = {
            let mut stmt = tx.prepare("SELECT filename FROM Cache WHERE filename IS NOT NULL")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?
        };
        let removed = tx.execute("DELETE FROM Cache", [])?;
        tx.commit()?;
        Ok((removed, filenames))
    }

    pub fn size(&self) -> Result<u64> {
        let total: i64 = self
            .conn
            .query_row("SELECT COALESCE(SUM(size), 0) FROM Cache", [], |row| row.get(0))?;
        Ok(total as u64)
    }

    pub fn count(&self) -> Result<u64> {
        let total: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM Cache", [], |row| row.get(0))?;
        Ok(total as u64)
    }

    /// Flush the WAL and close cleanly (spec.md §9 "Global cache singleton").
    pub fn close(self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

/// Runs inside an open transaction: deletes expired rows for free, then
/// deletes policy-selected victims until volume is under budget or
/// `cull_limit` victims have been removed (spec.md §4.D).
fn run_eviction_sweep(
    tx: &rusqlite::Transaction,
    policy: EvictionPolicy,
    size_limit: u64,
    cull_limit: u32,
    now: f64,
) -> Result<Vec<String>> {
    let mut evicted = Vec::new();

    // Free expiry-driven eviction: not counted against cull_limit.
    {
        let mut stmt = tx.prepare("SELECT filename FROM Cache WHERE expire_time IS NOT NULL AND expire_time <= ?1")?;
        let expired: Vec<Option<String>> = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        tx.execute("DELETE FROM Cache WHERE expire_time IS NOT NULL AND expire_time <= ?1", params![now])?;
        evicted.extend(expired.into_iter().flatten());
    }

    let mut victims_removed = 0u32;
    loop {
        let volume: i64 = tx.query_row("SELECT COALESCE(SUM(size), 0) FROM Cache", [], |row| row.get(0))?;
        if (volume as u64) <= size_limit || victims_removed >= cull_limit {
            break;
        }

        let order_by = policy.order_by();
        let query = format!("SELECT rowid, filename FROM Cache ORDER BY {order_by} LIMIT 1");
        let victim: Option<(i64, Option<String>)> = tx
            .query_row(&query, [], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        match victim {
            Some((rowid, filename)) => {
                tx.execute("DELETE FROM Cache WHERE rowid = ?1", params![rowid])?;
                if let Some(f) = filename {
                    evicted.push(f);
                }
                victims_removed += 1;
            }
            None => break,
        }
    }

    Ok(evicted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Index) {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(&dir.path().join("cache.db"), 64 * 1024 * 1024).unwrap();
        (dir, index)
    }

    fn new_entry<'a>(key: &'a [u8], headers: &'a HeaderBag, digest: &'a str, size: u64, now: f64) -> NewEntry<'a> {
        NewEntry {
            key,
            store_time: now,
            expire_time: None,
            headers,
            digest,
            size,
            mode: StorageMode::Inline,
            filename: None,
            inline_bytes: Some(b"xyz"),
        }
    }

    #[test]
    fn upsert_then_lookup_round_trips() {
        let (_dir, mut index) = open_temp();
        let headers = HeaderBag::default();
        index
            .upsert(new_entry(b"k1", &headers, "deadbeef", 3, 1000.0), EvictionPolicy::Lrs, 1 << 30, 10, 1000.0)
            .unwrap();

        let entry = index.lookup(b"k1", 1000.0).unwrap().unwrap();
        assert_eq!(entry.digest, "deadbeef");
        assert_eq!(entry.size, 3);
        assert_eq!(entry.access_count, 0);
    }

    #[test]
    fn lookup_treats_expired_as_absent() {
        let (_dir, mut index) = open_temp();
        let headers = HeaderBag::default();
        let mut entry = new_entry(b"k1", &headers, "deadbeef", 3, 1000.0);
        entry.expire_time = Some(1000.0);
        index.upsert(entry, EvictionPolicy::Lrs, 1 << 30, 10, 1000.0).unwrap();

        assert!(index.lookup(b"k1", 2000.0).unwrap().is_none());
        // And it's actually gone, not just hidden.
        assert_eq!(index.count().unwrap(), 0);
    }

    #[test]
    fn upsert_replaces_prior_row_and_reports_its_filename() {
        let (_dir, mut index) = open_temp();
        let headers = HeaderBag::default();

        let mut first = new_entry(b"k1", &headers, "digest1", 3, 1000.0);
        first.mode = StorageMode::File;
        first.filename = Some("ab/cd/first".to_string());
        first.inline_bytes = None;
        index.upsert(first, EvictionPolicy::Lrs, 1 << 30, 10, 1000.0).unwrap();

        let mut second = new_entry(b"k1", &headers, "digest2", 5, 1001.0);
        second.mode = StorageMode::File;
        second.filename = Some("ab/cd/second".to_string());
        second.inline_bytes = None;
        let outcome = index.upsert(second, EvictionPolicy::Lrs, 1 << 30, 10, 1001.0).unwrap();

        assert_eq!(outcome.replaced_filename.as_deref(), Some("ab/cd/first"));
        assert_eq!(index.count().unwrap(), 1);
        let entry = index.lookup(b"k1", 1001.0).unwrap().unwrap();
        assert_eq!(entry.digest, "digest2");
    }

    #[test]
    fn delete_returns_filename_and_removes_row() {
        let (_dir, mut index) = open_temp();
        let headers = HeaderBag::default();
        let mut entry = new_entry(b"k1", &headers, "digest1", 3, 1000.0);
        entry.mode = StorageMode::File;
        entry.filename = Some("ab/cd/f".to_string());
        entry.inline_bytes = None;
        index.upsert(entry, EvictionPolicy::Lrs, 1 << 30, 10, 1000.0).unwrap();

        let outcome = index.delete(b"k1").unwrap();
        assert!(outcome.existed);
        assert_eq!(outcome.filename.as_deref(), Some("ab/cd/f"));
        assert!(index.lookup(b"k1", 1000.0).unwrap().is_none());

        assert!(!index.delete(b"k1").unwrap().existed);
    }

    #[test]
    fn eviction_sweep_respects_size_limit_and_cull_limit() {
        let (_dir, mut index) = open_temp();
        let headers = HeaderBag::default();

        for i in 0..5u8 {
            let key = vec![i];
            index
                .upsert(new_entry(&key, &headers, "d", 10, 1000.0 + i as f64), EvictionPolicy::Lrs, 25, 1, 1000.0 + i as f64)
                .unwrap();
        }

        // size_limit=25, cull_limit=1 per call: volume converges over calls, never drops below budget in one shot.
        assert!(index.size().unwrap() <= 25 + 10);
    }

    #[test]
    fn lfu_orders_by_access_count_then_access_time() {
        let (_dir, mut index) = open_temp();
        let headers = HeaderBag::default();
        index.upsert(new_entry(b"a", &headers, "d", 10, 1000.0), EvictionPolicy::Lfu, 1 << 30, 10, 1000.0).unwrap();
        index.upsert(new_entry(b"b", &headers, "d", 10, 1001.0), EvictionPolicy::Lfu, 1 << 30, 10, 1001.0).unwrap();
        index.record_access(b"b", 1002.0).unwrap();

        // "a" has access_count 0, "b" has access_count 1: a goes first under LFU.
        let outcome = index.upsert(new_entry(b"c", &headers, "d", 100, 1003.0), EvictionPolicy::Lfu, 25, 1, 1003.0).unwrap();
        assert!(outcome.evicted_filenames.is_empty()); // inline entries have no filename
        assert!(index.lookup(b"a", 1003.0).unwrap().is_none());
        assert!(index.lookup(b"b", 1003.0).unwrap().is_some());
    }

    #[test]
    fn clear_removes_everything_and_lists_filenames() {
        let (_dir, mut index) = open_temp();
        let headers = HeaderBag::default();
        let mut entry = new_entry(b"k1", &headers, "d", 10, 1000.0);
        entry.mode = StorageMode::File;
        entry.filename = Some("ab/cd/f".to_string());
        entry.inline_bytes = None;
        index.upsert(entry, EvictionPolicy::Lrs, 1 << 30, 10, 1000.0).unwrap();

        let (removed, filenames) = index.clear().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(filenames, vec!["ab/cd/f".to_string()]);
        assert_eq!(index.count().unwrap(), 0);
    }
}
