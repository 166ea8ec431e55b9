use std::path::PathBuf;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use crate::blob_store::{BlobReader, BlobStore, ByteStream, FsBlobStore};
use crate::catalog::{
    validate_name, validate_owner, FileCatalog, FileId, FileRecord, NewFile, DIGEST_FILES_TREE,
    FILES_TREE, OWNER_ACTIVITY_TREE, OWNER_FILES_TREE,
};
use crate::error::{DedupError, Result};
use crate::hasher::ContentDigest;
use crate::metastore::{open_store, Durability, StorageEngine, Store};
use crate::metrics::SharedMetrics;
use crate::ref_index::{DigestGuard, ReferenceIndex, REFS_TREE};

/// Where and how a [`DedupStore`] keeps its data.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root of the blob store
    pub fs_root: PathBuf,
    /// Root of the metadata store
    pub meta_root: PathBuf,
    pub engine: StorageEngine,
    pub durability: Option<Durability>,
    /// Largest accepted upload in bytes, unlimited if unset
    pub max_upload_size: Option<u64>,
}

/// One upload of [`DedupStore::upload_batch`].
pub struct UploadRequest {
    pub owner: String,
    pub name: String,
    pub mime_type: String,
    pub stream: ByteStream,
    pub declared_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub file: FileRecord,
    pub digest: ContentDigest,
    pub size: u64,
    pub was_duplicate: bool,
    pub ref_count: u64,
    /// Bytes not written because the payload was already stored
    pub saved_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct DeleteReceipt {
    pub file: FileRecord,
    /// References left on the file's digest
    pub ref_count: u64,
    pub blob_deleted: bool,
}

/// An opened file: its (already counted) record and a stream of its content.
#[derive(Debug)]
pub struct Download {
    pub file: FileRecord,
    pub content: BlobReader,
}

/// A reference taken during an upload that has not yet been attached to a
/// file record. Dropping it while armed, either because a later step failed or
/// because the upload future was cancelled, gives the reference back and
/// deletes the blob if nothing else uses it. The digest lock is held until the
/// guard is gone.
struct PendingReference<'a> {
    refs: &'a ReferenceIndex,
    blobs: &'a dyn BlobStore,
    metrics: &'a SharedMetrics,
    guard: Option<DigestGuard>,
}

impl<'a> PendingReference<'a> {
    fn disarm(mut self) -> Option<DigestGuard> {
        self.guard.take()
    }
}

impl Drop for PendingReference<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let digest = *guard.key();
        match self.refs.release_locked(&guard) {
            Ok(released) if released.should_delete_blob => {
                warn!(%digest, "upload abandoned, dropping its blob");
                match self.blobs.purge(&digest) {
                    Ok(()) => self.metrics.blobs_dropped(1),
                    Err(e) => error!(%digest, error = %e, "could not delete blob of abandoned upload"),
                }
            }
            Ok(released) => {
                warn!(%digest, ref_count = released.ref_count, "upload abandoned, reference returned");
            }
            Err(e) => error!(%digest, error = %e, "could not return reference of abandoned upload"),
        }
    }
}

/// The deduplicating file store.
///
/// Uploads are staged and hashed before any lock is taken; the digest lock
/// then covers the reference count, the blob write and the catalog insert.
/// Reference counts are raised before a file record exists and lowered only
/// after it is gone, so a count can be too high after a crash but never too
/// low.
#[derive(Debug)]
pub struct DedupStore {
    meta: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    refs: ReferenceIndex,
    catalog: FileCatalog,
    metrics: SharedMetrics,
    max_upload_size: Option<u64>,
}

impl DedupStore {
    /// Opens the blob and metadata stores described by `config`.
    pub fn open(config: &StoreConfig, metrics: SharedMetrics) -> Result<Self> {
        let fs = FsBlobStore::new(&config.fs_root, metrics.clone())?;
        let meta = open_store(config.engine, &config.meta_root, config.durability)?;
        info!(
            fs_root = %config.fs_root.display(),
            meta_root = %config.meta_root.display(),
            engine = ?config.engine,
            "opened dedup store"
        );
        Self::with_parts(meta, Arc::new(fs), metrics, config.max_upload_size)
    }

    pub fn with_parts(
        meta: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        metrics: SharedMetrics,
        max_upload_size: Option<u64>,
    ) -> Result<Self> {
        Ok(Self {
            refs: ReferenceIndex::new(meta.as_ref(), metrics.clone())?,
            catalog: FileCatalog::new(Arc::clone(&meta))?,
            meta,
            blobs,
            metrics,
            max_upload_size,
        })
    }

    /// Stores `stream` as a new file of `owner`. Identical content already in
    /// the store is not written again.
    #[instrument(skip_all, fields(owner = %owner, name = %name))]
    pub async fn upload(
        &self,
        owner: &str,
        name: &str,
        mime_type: &str,
        stream: ByteStream,
        declared_size: Option<u64>,
    ) -> Result<UploadReceipt> {
        validate_owner(owner)?;
        validate_name(name)?;
        if let (Some(limit), Some(declared)) = (self.max_upload_size, declared_size) {
            if declared > limit {
                return Err(DedupError::SizeLimitExceeded {
                    limit,
                    actual: declared,
                });
            }
        }

        let staged = self.blobs.stage(stream, self.max_upload_size).await?;
        let digest = staged.digest();
        let size = staged.size();

        let guard = self.refs.lock(digest).await;
        let acquired = self.refs.acquire_locked(&guard, size)?;
        let pending = PendingReference {
            refs: &self.refs,
            blobs: self.blobs.as_ref(),
            metrics: &self.metrics,
            guard: Some(guard),
        };

        if acquired.is_new {
            let outcome = self.blobs.put_if_absent(&digest, staged).await?;
            if !outcome.stored {
                debug!(%digest, "adopted unreferenced blob");
            }
        } else if self.blobs.contains(&digest).await? {
            self.metrics.duplicate_hit();
            drop(staged);
        } else {
            warn!(%digest, "referenced blob is missing, storing it again");
            self.blobs.put_if_absent(&digest, staged).await?;
        }

        let file = self
            .catalog
            .create(NewFile {
                owner: owner.to_string(),
                name: name.to_string(),
                mime_type: mime_type.to_string(),
                digest,
                size,
                duplicate: !acquired.is_new,
            })
            .await?;
        drop(pending.disarm());

        let was_duplicate = !acquired.is_new;
        debug!(id = %file.id, %digest, size, was_duplicate, ref_count = acquired.ref_count, "upload complete");
        Ok(UploadReceipt {
            file,
            digest,
            size,
            was_duplicate,
            ref_count: acquired.ref_count,
            saved_bytes: if was_duplicate { size } else { 0 },
        })
    }

    /// Uploads every request concurrently. One failure does not affect the
    /// others; results come back in request order.
    pub async fn upload_batch(&self, requests: Vec<UploadRequest>) -> Vec<Result<UploadReceipt>> {
        join_all(requests.into_iter().map(|req| async move {
            self.upload(
                &req.owner,
                &req.name,
                &req.mime_type,
                req.stream,
                req.declared_size,
            )
            .await
        }))
        .await
    }

    /// Removes a file. The blob goes away with its last reference.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &FileId) -> Result<DeleteReceipt> {
        let file = self.catalog.remove(id).await?;

        let guard = self.refs.lock(file.digest).await;
        let released = self.refs.release_locked(&guard)?;
        let mut blob_deleted = false;
        if released.should_delete_blob {
            match self.blobs.delete_if_present(&file.digest).await {
                Ok(removed) => {
                    blob_deleted = removed;
                    if removed {
                        self.metrics.blobs_dropped(1);
                    }
                }
                // the file is gone either way; the blob is left as an orphan
                Err(e) => error!(digest = %file.digest, error = %e, "failed to delete unreferenced blob"),
            }
        }
        drop(guard);

        debug!(%id, digest = %file.digest, ref_count = released.ref_count, blob_deleted, "deleted file");
        Ok(DeleteReceipt {
            file,
            ref_count: released.ref_count,
            blob_deleted,
        })
    }

    /// Opens a file for reading and counts the download. A file deleted while
    /// being opened is reported as `NotFound`.
    #[instrument(skip(self))]
    pub async fn download(&self, id: &FileId) -> Result<Download> {
        self.open_counted(id)
            .await
            .map_err(DedupError::conflict_as_not_found)
    }

    async fn open_counted(&self, id: &FileId) -> Result<Download> {
        let file = self.catalog.get(id)?;
        let content = match self.blobs.get(&file.digest).await {
            Ok(content) => content,
            Err(DedupError::NotFound(_)) if self.catalog.contains(id)? => {
                let msg = format!("blob {} of live file {id} is missing", file.digest);
                error!("{msg}");
                self.metrics.invariant_violation();
                return Err(DedupError::InvariantViolation(msg));
            }
            Err(DedupError::NotFound(_)) => {
                return Err(DedupError::Conflict(format!("file {id} deleted while opening")))
            }
            Err(e) => return Err(e),
        };
        let file = self
            .catalog
            .record_download(id)
            .await
            .map_err(|e| match e {
                DedupError::NotFound(_) => {
                    DedupError::Conflict(format!("file {id} deleted while opening"))
                }
                other => other,
            })?;
        Ok(Download { file, content })
    }

    /// Opens a payload by digest. Only referenced digests are served.
    pub async fn download_by_digest(&self, digest: &ContentDigest) -> Result<BlobReader> {
        self.refs.peek(digest)?;
        self.blobs.get(digest).await
    }

    pub async fn rename(&self, id: &FileId, name: &str) -> Result<FileRecord> {
        self.catalog.rename(id, name).await
    }

    pub async fn set_visibility(&self, id: &FileId, public: bool) -> Result<FileRecord> {
        self.catalog.set_visibility(id, public).await
    }

    /// Discards staged uploads left behind by an earlier process. Call before
    /// accepting uploads.
    pub async fn clear_staging(&self) -> Result<usize> {
        self.blobs.clear_staging().await
    }

    /// Key count of every metadata tree.
    pub fn tree_sizes(&self) -> Result<Vec<(&'static str, usize)>> {
        [REFS_TREE, FILES_TREE, OWNER_FILES_TREE, DIGEST_FILES_TREE, OWNER_ACTIVITY_TREE]
            .into_iter()
            .map(|tree| Ok((tree, self.meta.num_keys(tree)?)))
            .collect()
    }

    /// Flushes the metadata store.
    pub fn persist(&self) -> Result<()> {
        Ok(self.meta.persist()?)
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    pub fn refs(&self) -> &ReferenceIndex {
        &self.refs
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn meta(&self) -> &dyn Store {
        self.meta.as_ref()
    }

    pub fn max_upload_size(&self) -> Option<u64> {
        self.max_upload_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobInfo, PutOutcome, StagedBlob};
    use crate::error::MetaError;
    use crate::metastore::{MemoryStore, MetaTreeExt, WriteBatch};
    use bytes::Bytes;
    use std::io;

    fn stream_of(payload: &'static [u8]) -> ByteStream {
        Box::pin(futures::stream::iter(vec![Ok::<_, io::Error>(
            Bytes::from_static(payload),
        )]))
    }

    fn store(dir: &std::path::Path, limit: Option<u64>) -> DedupStore {
        let blobs = FsBlobStore::new(dir, SharedMetrics::default()).unwrap();
        DedupStore::with_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(blobs),
            SharedMetrics::default(),
            limit,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_upload_shares_blob() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), None);

        let first = s.upload("alice", "a.txt", "text/plain", stream_of(b"hello"), None).await.unwrap();
        assert!(!first.was_duplicate);
        assert_eq!(first.ref_count, 1);
        assert_eq!(first.saved_bytes, 0);

        let second = s.upload("bob", "b.txt", "text/plain", stream_of(b"hello"), None).await.unwrap();
        assert!(second.was_duplicate);
        assert_eq!(second.ref_count, 2);
        assert_eq!(second.saved_bytes, 5);
        assert_eq!(first.digest, second.digest);
        assert_eq!(s.blobs().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_declared_size_rejected_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), Some(4));

        let err = s
            .upload("alice", "big", "", stream_of(b"hello"), Some(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::SizeLimitExceeded { limit: 4, actual: 100 }));

        let err = s
            .upload("alice", "big", "", stream_of(b"hello"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DedupError::SizeLimitExceeded { limit: 4, .. }));
        assert!(s.refs().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_delete_last_reference_removes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), None);

        let a = s.upload("alice", "a", "", stream_of(b"data"), None).await.unwrap();
        let b = s.upload("alice", "b", "", stream_of(b"data"), None).await.unwrap();

        let receipt = s.delete(&a.file.id).await.unwrap();
        assert_eq!(receipt.ref_count, 1);
        assert!(!receipt.blob_deleted);
        assert!(s.blobs().contains(&a.digest).await.unwrap());

        let receipt = s.delete(&b.file.id).await.unwrap();
        assert_eq!(receipt.ref_count, 0);
        assert!(receipt.blob_deleted);
        assert!(!s.blobs().contains(&a.digest).await.unwrap());
        assert!(matches!(s.refs().peek(&a.digest), Err(DedupError::NotFound(_))));
        assert!(matches!(s.delete(&b.file.id).await, Err(DedupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_download_counts() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), None);
        let up = s.upload("alice", "a", "", stream_of(b"content"), None).await.unwrap();

        let dl = s.download(&up.file.id).await.unwrap();
        assert_eq!(dl.file.download_count, 1);
        assert_eq!(&dl.content.read_all().await.unwrap()[..], b"content");

        let by_digest = s.download_by_digest(&up.digest).await.unwrap();
        assert_eq!(by_digest.len(), 7);

        s.delete(&up.file.id).await.unwrap();
        assert!(matches!(s.download(&up.file.id).await, Err(DedupError::NotFound(_))));
        assert!(matches!(
            s.download_by_digest(&up.digest).await,
            Err(DedupError::NotFound(_))
        ));
    }

    #[derive(Debug)]
    struct FailingPuts(FsBlobStore);

    #[async_trait::async_trait]
    impl BlobStore for FailingPuts {
        async fn stage(&self, stream: ByteStream, limit: Option<u64>) -> Result<StagedBlob> {
            self.0.stage(stream, limit).await
        }

        async fn put_if_absent(&self, _: &ContentDigest, _: StagedBlob) -> Result<PutOutcome> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full").into())
        }

        async fn get(&self, digest: &ContentDigest) -> Result<BlobReader> {
            self.0.get(digest).await
        }

        async fn delete_if_present(&self, digest: &ContentDigest) -> Result<bool> {
            self.0.delete_if_present(digest).await
        }

        fn purge(&self, digest: &ContentDigest) -> io::Result<()> {
            self.0.purge(digest)
        }

        async fn contains(&self, digest: &ContentDigest) -> Result<bool> {
            self.0.contains(digest).await
        }

        async fn list(&self) -> Result<Vec<BlobInfo>> {
            self.0.list().await
        }
    }

    #[tokio::test]
    async fn test_failed_write_returns_reference() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FailingPuts(FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap());
        let s = DedupStore::with_parts(
            Arc::new(MemoryStore::new()),
            Arc::new(blobs),
            SharedMetrics::default(),
            None,
        )
        .unwrap();

        let err = s.upload("alice", "a", "", stream_of(b"x"), None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(s.refs().is_empty().unwrap());
        assert!(s.catalog().is_empty().unwrap());
        assert_eq!(s.refs().locks_in_use(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_owner_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), None);
        let err = s.upload("", "name", "", stream_of(b"y"), None).await.unwrap_err();
        assert!(matches!(err, DedupError::InvalidInput(_)));
        assert!(s.blobs().list().await.unwrap().is_empty());
    }

    #[derive(Debug)]
    struct FailingCommits(MemoryStore);

    struct RejectedBatch;

    impl WriteBatch for RejectedBatch {
        fn insert(&mut self, _: &str, _: &[u8], _: Vec<u8>) -> std::result::Result<(), MetaError> {
            Ok(())
        }

        fn remove(&mut self, _: &str, _: &[u8]) -> std::result::Result<(), MetaError> {
            Ok(())
        }

        fn commit(self: Box<Self>) -> std::result::Result<(), MetaError> {
            Err(MetaError::Backend("boom".into()))
        }
    }

    impl Store for FailingCommits {
        fn tree_open(&self, name: &str) -> std::result::Result<Arc<dyn MetaTreeExt>, MetaError> {
            self.0.tree_open(name)
        }

        fn batch(&self) -> Box<dyn WriteBatch> {
            Box::new(RejectedBatch)
        }

        fn num_keys(&self, tree: &str) -> std::result::Result<usize, MetaError> {
            self.0.num_keys(tree)
        }

        fn disk_space(&self) -> u64 {
            self.0.disk_space()
        }

        fn persist(&self) -> std::result::Result<(), MetaError> {
            self.0.persist()
        }
    }

    #[tokio::test]
    async fn test_failed_catalog_write_drops_new_blob() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::new(dir.path(), SharedMetrics::default()).unwrap();
        let s = DedupStore::with_parts(
            Arc::new(FailingCommits(MemoryStore::new())),
            Arc::new(blobs),
            SharedMetrics::default(),
            None,
        )
        .unwrap();

        let err = s.upload("alice", "a", "", stream_of(b"fresh"), None).await.unwrap_err();
        assert!(matches!(err, DedupError::Meta(MetaError::Backend(_))), "{err}");

        let digest = crate::hasher::digest_bytes(b"fresh");
        assert!(matches!(s.refs().peek(&digest), Err(DedupError::NotFound(_))));
        assert!(s.blobs().list().await.unwrap().is_empty());
        assert!(s.catalog().is_empty().unwrap());
        assert_eq!(s.refs().locks_in_use(), 0);
    }

    #[test]
    fn test_store_is_debug() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), None);
        assert!(format!("{s:?}").contains("DedupStore"));
    }

    #[derive(Default)]
    struct DropCounter(std::sync::atomic::AtomicU64);

    impl crate::metrics::MetricsCollector for DropCounter {
        fn blob_pending(&self) {}
        fn blob_written(&self) {}
        fn blob_write_error(&self) {}
        fn duplicate_hit(&self) {}
        fn blobs_dropped(&self, amount: u64) {
            self.0.fetch_add(amount, std::sync::atomic::Ordering::SeqCst);
        }
        fn bytes_sent(&self, _: usize) {}
        fn bytes_received(&self, _: usize) {}
        fn invariant_violation(&self) {}
    }

    #[tokio::test]
    async fn test_dropped_blobs_counted_only_when_removed() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(DropCounter::default());
        let metrics = SharedMetrics::new(counter.clone());
        let blobs = FsBlobStore::new(dir.path(), metrics.clone()).unwrap();
        let s = DedupStore::with_parts(Arc::new(MemoryStore::new()), Arc::new(blobs), metrics, None)
            .unwrap();

        let a = s.upload("alice", "a", "", stream_of(b"one"), None).await.unwrap();
        assert!(s.delete(&a.file.id).await.unwrap().blob_deleted);
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        // blob removed behind the store's back
        let b = s.upload("alice", "b", "", stream_of(b"two"), None).await.unwrap();
        s.blobs().purge(&b.digest).unwrap();
        assert!(!s.delete(&b.file.id).await.unwrap().blob_deleted);
        assert_eq!(counter.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
