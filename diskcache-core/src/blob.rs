//! Raw byte storage: inline buffers for small values, sharded files for
//! large ones.
//!
//! File layout follows the two-level hex sharding
//! `mosaicfs-vfs::cache::FileCache` uses for its own cache directory
//! (`shard_path`/`entry_path`), generalized from a per-file UUID seed to a
//! hash of the cache *key* so repeated writes under the same key land in
//! the same shard directory, while a trailing UUID component keeps every
//! stored revision's filename unique.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};

use crate::error::{CacheError, Result};

pub const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Inline,
    File,
}

/// The result of a successful `store`.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub size: u64,
    pub mode: StorageMode,
    /// Relative path under the blob root. `Some` iff `mode == File`.
    pub filename: Option<String>,
    /// `Some` iff `mode == Inline`.
    pub inline_bytes: Option<Vec<u8>>,
    pub digest: String,
}

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First two hex levels of `sha256(key)`, used as the shard directories.
    fn shard_of(key: &[u8]) -> (String, String) {
        let digest = Sha256::digest(key);
        let hex = hex::encode(digest);
        (hex[0..2].to_string(), hex[2..4].to_string())
    }

    /// Consume `stream` to EOF, accumulating a rolling SHA-256 digest and
    /// either an in-memory buffer or a newly created file, per spec.
    ///
    /// This follows the bounded-channel design in spec.md §9 rather than
    /// the source's busy-wait queue: the caller task forwards chunks into a
    /// `tokio::sync::mpsc::channel` of capacity 10 while a second task
    /// drains it, hashes, and writes — the channel's bounded capacity is
    /// the backpressure mechanism.
    pub async fn store<S, E>(
        &self,
        mut stream: S,
        key: &[u8],
        declared_length: Option<u64>,
        inline_threshold: u64,
        value_size_limit: u64,
    ) -> Result<StoredBlob>
    where
        S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(10);
        let root = self.root.clone();
        let key = key.to_vec();

        let writer = tokio::spawn(write_blob(
            root,
            key,
            rx,
            declared_length,
            inline_threshold,
            value_size_limit,
        ));

        let mut read_error = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if tx.send(chunk).await.is_err() {
                        // Writer task gave up early (size limit hit); stop
                        // reading and let its error surface below.
                        break;
                    }
                }
                Err(e) => {
                    // Client disconnected or the body stream otherwise
                    // failed mid-transfer. Stop feeding the writer so it
                    // sees EOF, but don't let it believe this was a clean
                    // finish: whatever it staged must not survive (spec.md
                    // §5 "Cancellation & timeouts").
                    read_error = Some(CacheError::Io(std::io::Error::other(e.to_string())));
                    break;
                }
            }
        }
        drop(tx);

        let result = writer
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e.to_string())))?;

        if let Some(err) = read_error {
            if let Ok(stored) = result {
                if let Some(filename) = stored.filename {
                    self.unlink(&filename).await;
                }
            }
            return Err(err);
        }

        result
    }

    /// Open a reader for an entry, yielding `CHUNK_SIZE` chunks. Must not be
    /// called while holding any index lock.
    pub fn open_reader(
        &self,
        mode: StorageMode,
        filename: Option<&str>,
        inline_bytes: Option<Vec<u8>>,
    ) -> Result<impl Stream<Item = std::io::Result<bytes::Bytes>>> {
        match mode {
            StorageMode::Inline => {
                let bytes = inline_bytes.unwrap_or_default();
                Ok(InlineOrFileReader::Inline(Some(bytes::Bytes::from(bytes))))
            }
            StorageMode::File => {
                let filename = filename.ok_or_else(|| {
                    CacheError::Corrupt("file-mode entry has no filename".to_string())
                })?;
                let path = self.root.join(filename);
                Ok(InlineOrFileReader::File(Box::pin(file_chunks(path))))
            }
        }
    }

    /// Best-effort removal; a missing file is not an error.
    pub async fn unlink(&self, filename: &str) {
        let path = self.root.join(filename);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to unlink blob file");
            }
        }
    }

    /// Walk the two-level shard subdirectories under the blob root and
    /// delete any blob file whose relative path is not in `referenced`.
    /// Run once at boot (spec.md §7).
    ///
    /// Deliberately scoped to `<hex>/<hex>/<name>` paths rather than the
    /// whole root: the root also holds `cache.db` and its `-wal`/`-shm`
    /// sidecars, which never appear in `referenced` (that set only ever
    /// contains blob-store relative paths) and would otherwise look like
    /// orphans and get deleted on every boot.
    pub fn sweep_orphans(&self, referenced: &std::collections::HashSet<String>) -> usize {
        let mut removed = 0;
        for shard_a in shard_level_dirs(&self.root) {
            for shard_b in shard_level_dirs(&shard_a) {
                for entry in walkdir::WalkDir::new(&shard_b)
                    .min_depth(1)
                    .max_depth(1)
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let path = entry.path();
                    let Ok(rel) = path.strip_prefix(&self.root) else {
                        continue;
                    };
                    let rel_str = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                    if !referenced.contains(&rel_str) && std::fs::remove_file(path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        removed
    }
}

/// Direct subdirectories of `dir` whose name is exactly two lowercase hex
/// digits, i.e. one level of the blob store's shard path.
fn shard_level_dirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| is_hex_shard_name(p.file_name().and_then(|n| n.to_str()).unwrap_or("")))
        .collect()
}

fn is_hex_shard_name(name: &str) -> bool {
    name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

enum InlineOrFileReader {
    Inline(Option<bytes::Bytes>),
    File(std::pin::Pin<Box<dyn Stream<Item = std::io::Result<bytes::Bytes>> + Send>>),
}

impl Stream for InlineOrFileReader {
    type Item = std::io::Result<bytes::Bytes>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this {
            InlineOrFileReader::Inline(slot) => std::task::Poll::Ready(slot.take().map(Ok)),
            InlineOrFileReader::File(inner) => inner.as_mut().poll_next(cx),
        }
    }
}

fn file_chunks(path: PathBuf) -> impl Stream<Item = std::io::Result<bytes::Bytes>> {
    async_stream::try_stream! {
        let mut file = tokio::fs::File::open(&path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            use tokio::io::AsyncReadExt;
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            yield bytes::Bytes::copy_from_slice(&buf[..n]);
        }
    }
}

enum Sink {
    Inline(Vec<u8>),
    File { file: tokio::fs::File, rel_path: String },
}

async fn create_blob_file(root: &Path, key: &[u8]) -> Result<(String, tokio::fs::File)> {
    let (a, b) = BlobStore::shard_of(key);
    let dir = root.join(&a).join(&b);
    tokio::fs::create_dir_all(&dir).await?;
    let name = uuid::Uuid::new_v4().to_string();
    let rel_path = format!("{a}/{b}/{name}");
    let path = root.join(&rel_path);
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await?;
    Ok((rel_path, file))
}

async fn write_blob(
    root: PathBuf,
    key: Vec<u8>,
    mut rx: tokio::sync::mpsc::Receiver<bytes::Bytes>,
    declared_length: Option<u64>,
    inline_threshold: u64,
    value_size_limit: u64,
) -> Result<StoredBlob> {
    let mut hasher = Sha256::new();
    let mut total: u64 = 0;

    let start_as_file = declared_length.map(|n| n >= inline_threshold).unwrap_or(false);
    let mut sink = if start_as_file {
        let (rel_path, file) = create_blob_file(&root, &key).await?;
        Sink::File { file, rel_path }
    } else {
        Sink::Inline(Vec::new())
    };

    while let Some(chunk) = rx.recv().await {
        total += chunk.len() as u64;
        if total > value_size_limit {
            cleanup_partial(&root, &sink).await;
            return Err(CacheError::SizeLimitExceeded);
        }
        hasher.update(&chunk);

        let needs_transition = match &mut sink {
            Sink::File { file, .. } => {
                file.write_all(&chunk).await?;
                false
            }
            Sink::Inline(buf) => {
                buf.extend_from_slice(&chunk);
                buf.len() as u64 >= inline_threshold
            }
        };

        if needs_transition {
            if let Sink::Inline(buf) = std::mem::replace(&mut sink, Sink::Inline(Vec::new())) {
                let (rel_path, mut file) = match create_blob_file(&root, &key).await {
                    Ok(v) => v,
                    Err(e) => return Err(e),
                };
                file.write_all(&buf).await?;
                sink = Sink::File { file, rel_path };
            }
        }
    }

    if let Some(declared) = declared_length {
        if declared != total {
            cleanup_partial(&root, &sink).await;
            return Err(CacheError::SizeMismatch);
        }
    }

    let digest = hex::encode(hasher.finalize());

    match sink {
        Sink::Inline(buf) => Ok(StoredBlob {
            size: total,
            mode: StorageMode::Inline,
            filename: None,
            inline_bytes: Some(buf),
            digest,
        }),
        Sink::File { mut file, rel_path } => {
            file.flush().await?;
            file.sync_all().await?;
            Ok(StoredBlob {
                size: total,
                mode: StorageMode::File,
                filename: Some(rel_path),
                inline_bytes: None,
                digest,
            })
        }
    }
}

async fn cleanup_partial(root: &Path, sink: &Sink) {
    if let Sink::File { rel_path, .. } = sink {
        let _ = tokio::fs::remove_file(root.join(rel_path)).await;
    }
}
