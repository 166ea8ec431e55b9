//! Physical payload storage.
//!
//! Blobs are addressed by [`ContentDigest`]. Where a blob lives on disk is a
//! detail of the implementation: callers only ever see digests.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DedupError, Result};
use crate::hasher::{ContentDigest, Hasher};
use crate::metrics::SharedMetrics;

/// Boxed stream of payload chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Result of [`BlobStore::put_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Whether this call performed the physical write
    pub stored: bool,
    pub size: u64,
}

/// A blob listed by [`BlobStore::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlobInfo {
    pub digest: ContentDigest,
    pub size: u64,
}

/// A payload that has been hashed and spooled to a temporary location but is
/// not yet visible under its digest. Dropping it discards the temporary copy.
pub struct StagedBlob {
    digest: ContentDigest,
    size: u64,
    path: PathBuf,
}

impl StagedBlob {
    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for StagedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedBlob")
            .field("digest", &self.digest)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for StagedBlob {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove staged blob");
            }
        }
    }
}

/// Streamed read of a stored blob.
pub struct BlobReader {
    digest: ContentDigest,
    len: u64,
    inner: ByteStream,
}

impl BlobReader {
    pub fn digest(&self) -> ContentDigest {
        self.digest
    }

    /// Total payload length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the remaining payload into memory.
    pub async fn read_all(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.len as usize);
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader")
            .field("digest", &self.digest)
            .field("len", &self.len)
            .finish()
    }
}

impl Stream for BlobReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Durable content-addressed payload storage.
///
/// The store does not know about reference counts: deciding when a blob may be
/// deleted belongs to the [`ReferenceIndex`](crate::ReferenceIndex).
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Spools `stream` to a temporary location while hashing it. Fails with
    /// [`DedupError::SizeLimitExceeded`] as soon as more than `limit` bytes
    /// have been read.
    async fn stage(&self, stream: ByteStream, limit: Option<u64>) -> Result<StagedBlob>;

    /// Makes `staged` visible under `digest` unless a payload already exists.
    /// Only one of several racing callers observes `stored == true`.
    async fn put_if_absent(&self, digest: &ContentDigest, staged: StagedBlob) -> Result<PutOutcome>;

    /// Opens the payload for reading.
    async fn get(&self, digest: &ContentDigest) -> Result<BlobReader>;

    /// Removes the payload. Returns whether something was removed.
    async fn delete_if_present(&self, digest: &ContentDigest) -> Result<bool>;

    /// Blocking removal for drop paths that cannot await.
    fn purge(&self, digest: &ContentDigest) -> io::Result<()>;

    async fn contains(&self, digest: &ContentDigest) -> Result<bool>;

    /// Lists every stored payload.
    async fn list(&self) -> Result<Vec<BlobInfo>>;

    /// Removes leftovers of stages interrupted by a crash. Only safe while no
    /// upload is running.
    async fn clear_staging(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Blob store on a local filesystem.
///
/// Layout under the root:
///
/// ```text
/// blobs/<hex[0..2]>/<hex[2..4]>/<hex>
/// tmp/<uuid>
/// ```
pub struct FsBlobStore {
    blob_root: PathBuf,
    tmp_root: PathBuf,
    metrics: SharedMetrics,
}

impl fmt::Debug for FsBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsBlobStore")
            .field("blob_root", &self.blob_root)
            .finish()
    }
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>, metrics: SharedMetrics) -> io::Result<Self> {
        let root = root.as_ref();
        let blob_root = root.join("blobs");
        let tmp_root = root.join("tmp");
        std::fs::create_dir_all(&blob_root)?;
        std::fs::create_dir_all(&tmp_root)?;
        Ok(Self {
            blob_root,
            tmp_root,
            metrics,
        })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.to_hex();
        self.blob_root.join(&hex[0..2]).join(&hex[2..4]).join(&hex)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn stage(&self, mut stream: ByteStream, limit: Option<u64>) -> Result<StagedBlob> {
        self.metrics.blob_pending();
        let path = self.tmp_root.join(Uuid::new_v4().to_string());
        let mut file = async_fs::File::create(&path).await?;

        // Owns the temp file from here on, so every early return cleans up.
        let mut staged = StagedBlob {
            digest: ContentDigest::from_bytes([0; 32]),
            size: 0,
            path,
        };

        let mut hasher = Hasher::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let total = hasher.len() + chunk.len() as u64;
            if let Some(limit) = limit {
                if total > limit {
                    return Err(DedupError::SizeLimitExceeded {
                        limit,
                        actual: total,
                    });
                }
            }
            hasher.update(&chunk);
            if let Err(e) = file.write_all(&chunk).await {
                self.metrics.blob_write_error();
                return Err(e.into());
            }
            self.metrics.bytes_received(chunk.len());
        }
        file.flush().await?;
        file.sync_all().await?;

        let (digest, size) = hasher.finalize();
        staged.digest = digest;
        staged.size = size;
        debug!(%digest, size, "staged blob");
        Ok(staged)
    }

    async fn put_if_absent(&self, digest: &ContentDigest, staged: StagedBlob) -> Result<PutOutcome> {
        if staged.digest != *digest {
            return Err(DedupError::InvalidInput(format!(
                "staged payload hashes to {}, not {}",
                staged.digest, digest
            )));
        }

        let target = self.blob_path(digest);
        if let Some(parent) = target.parent() {
            async_fs::create_dir_all(parent).await?;
        }

        // A hard link fails if the target exists, which gives create-new
        // semantics without ever exposing a partially written file.
        let outcome = match async_fs::hard_link(staged.path(), &target).await {
            Ok(()) => {
                self.metrics.blob_written();
                debug!(%digest, size = staged.size, "stored blob");
                PutOutcome {
                    stored: true,
                    size: staged.size,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(%digest, "blob already present");
                PutOutcome {
                    stored: false,
                    size: staged.size,
                }
            }
            Err(e) => {
                self.metrics.blob_write_error();
                return Err(e.into());
            }
        };
        drop(staged);
        Ok(outcome)
    }

    async fn get(&self, digest: &ContentDigest) -> Result<BlobReader> {
        let path = self.blob_path(digest);
        let file = match async_fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DedupError::NotFound(format!("blob {digest}")));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();

        let metrics = self.metrics.clone();
        let inner = futures::stream::try_unfold(file, |mut file| async move {
            let mut buf = vec![0; READ_CHUNK_SIZE];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                Ok(None)
            } else {
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), file)))
            }
        })
        .inspect_ok(move |chunk: &Bytes| metrics.bytes_sent(chunk.len()));

        Ok(BlobReader {
            digest: *digest,
            len,
            inner: Box::pin(inner),
        })
    }

    async fn delete_if_present(&self, digest: &ContentDigest) -> Result<bool> {
        match async_fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => {
                debug!(%digest, "deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn purge(&self, digest: &ContentDigest) -> io::Result<()> {
        match std::fs::remove_file(self.blob_path(digest)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn contains(&self, digest: &ContentDigest) -> Result<bool> {
        match async_fs::metadata(self.blob_path(digest)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<BlobInfo>> {
        let mut blobs = Vec::new();
        let mut level1 = async_fs::read_dir(&self.blob_root).await?;
        while let Some(shard1) = level1.try_next().await? {
            if !shard1.file_type().await?.is_dir() {
                continue;
            }
            let mut level2 = async_fs::read_dir(shard1.path()).await?;
            while let Some(shard2) = level2.try_next().await? {
                if !shard2.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = async_fs::read_dir(shard2.path()).await?;
                while let Some(entry) = files.try_next().await? {
                    let name = entry.file_name();
                    let Some(digest) = name.to_str().and_then(|n| n.parse::<ContentDigest>().ok())
                    else {
                        warn!(path = %entry.path().display(), "ignoring unexpected file in blob root");
                        continue;
                    };
                    let size = entry.metadata().await?.len();
                    blobs.push(BlobInfo { digest, size });
                }
            }
        }
        blobs.sort_by_key(|b| b.digest);
        Ok(blobs)
    }

    async fn clear_staging(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = async_fs::read_dir(&self.tmp_root).await?;
        while let Some(entry) = entries.try_next().await? {
            async_fs::remove_file(entry.path()).await?;
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "cleared stale staged blobs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::digest_bytes;

    fn bytes_stream(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        Box::pin(futures::stream::iter(items))
    }

    fn tmp_entries(root: &Path) -> usize {
        std::fs::read_dir(root.join("tmp")).unwrap().count()
    }

    #[tokio::test]
    async fn test_stage_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();

        let staged = store.stage(bytes_stream(&[b"hel", b"lo"]), None).await.unwrap();
        let digest = staged.digest();
        assert_eq!(digest, digest_bytes(b"hello"));
        assert_eq!(staged.size(), 5);

        let outcome = store.put_if_absent(&digest, staged).await.unwrap();
        assert_eq!(outcome, PutOutcome { stored: true, size: 5 });
        assert_eq!(tmp_entries(dir.path()), 0);
        assert!(store.contains(&digest).await.unwrap());

        let reader = store.get(&digest).await.unwrap();
        assert_eq!(reader.len(), 5);
        assert_eq!(&reader.read_all().await.unwrap()[..], b"hello");

        assert!(store.delete_if_present(&digest).await.unwrap());
        assert!(!store.delete_if_present(&digest).await.unwrap());
        assert!(matches!(store.get(&digest).await, Err(DedupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_second_put_is_not_a_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();

        let first = store.stage(bytes_stream(&[b"same"]), None).await.unwrap();
        let second = store.stage(bytes_stream(&[b"same"]), None).await.unwrap();
        let digest = first.digest();

        assert!(store.put_if_absent(&digest, first).await.unwrap().stored);
        assert!(!store.put_if_absent(&digest, second).await.unwrap().stored);
        assert_eq!(tmp_entries(dir.path()), 0);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stage_enforces_limit_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();

        let err = store
            .stage(bytes_stream(&[b"1234", b"5678"]), Some(6))
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::SizeLimitExceeded { limit: 6, actual: 8 }));
        assert_eq!(tmp_entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_dropped_stage_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();

        let staged = store.stage(bytes_stream(&[b"abc"]), None).await.unwrap();
        assert_eq!(tmp_entries(dir.path()), 1);
        drop(staged);
        assert_eq!(tmp_entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();

        let staged = store.stage(bytes_stream(&[b"abc"]), None).await.unwrap();
        let other = digest_bytes(b"xyz");
        assert!(matches!(
            store.put_if_absent(&other, staged).await,
            Err(DedupError::InvalidInput(_))
        ));
        assert!(!store.contains(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();

        for payload in [&b"one"[..], &b"two"[..]] {
            let staged = store
                .stage(Box::pin(futures::stream::iter(vec![Ok(Bytes::copy_from_slice(payload))])), None)
                .await
                .unwrap();
            let digest = staged.digest();
            store.put_if_absent(&digest, staged).await.unwrap();
        }

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|b| b.size == 3));

        store.purge(&listed[0].digest).unwrap();
        store.purge(&listed[0].digest).unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_staging_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();
        std::fs::write(dir.path().join("tmp").join("stale-1"), b"partial").unwrap();
        std::fs::write(dir.path().join("tmp").join("stale-2"), b"partial").unwrap();

        assert_eq!(store.clear_staging().await.unwrap(), 2);
        assert_eq!(tmp_entries(dir.path()), 0);
        assert_eq!(store.clear_staging().await.unwrap(), 0);
    }
}
