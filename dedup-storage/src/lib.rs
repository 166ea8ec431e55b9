//! Content-addressed file storage with whole-file deduplication.
//!
//! Uploaded files are hashed with SHA-256. Each distinct payload is stored once
//! in a [`BlobStore`], a [`ReferenceIndex`] counts how many files point at it,
//! and a [`FileCatalog`] keeps the per-owner file records. [`DedupStore`] ties
//! them together and keeps the count at least as high as the number of files
//! at every step, so a blob is never deleted while a file still needs it.
//!
//! # Example
//!
//! ```no_run
//! use dedup_storage::{DedupStore, SharedMetrics, StorageEngine, StoreConfig};
//!
//! # async fn example() -> dedup_storage::Result<()> {
//! let config = StoreConfig {
//!     fs_root: "/var/lib/dedup/fs".into(),
//!     meta_root: "/var/lib/dedup/meta".into(),
//!     engine: StorageEngine::Fjall,
//!     durability: None,
//!     max_upload_size: Some(100 * 1024 * 1024),
//! };
//! let store = DedupStore::open(&config, SharedMetrics::default())?;
//!
//! let body = futures::stream::iter(vec![Ok::<_, std::io::Error>(
//!     bytes::Bytes::from_static(b"hello"),
//! )]);
//! let receipt = store
//!     .upload("alice", "hello.txt", "text/plain", Box::pin(body), Some(5))
//!     .await?;
//! assert!(!receipt.was_duplicate);
//! # Ok(())
//! # }
//! ```

pub mod accounting;
pub mod blob_store;
pub mod catalog;
pub mod check;
pub mod error;
pub mod hasher;
pub mod keyed_lock;
pub mod metastore;
pub mod metrics;
pub mod pipeline;
pub mod ref_index;

pub use accounting::{
    ActivityTotals, DuplicateGroup, FileListing, FileSummary, OwnerReport, Scope, StorageStats,
};
pub use blob_store::{BlobInfo, BlobReader, BlobStore, ByteStream, FsBlobStore, PutOutcome, StagedBlob};
pub use catalog::{
    FileCatalog, FileFilter, FileId, FilePage, FileRecord, NewFile, OwnerActivity, PageRequest,
    SortKey, SortSpec,
};
pub use check::{CountMismatch, IntegrityReport};
pub use error::{DedupError, MetaError, Result};
pub use hasher::{digest_bytes, hash_stream, ContentDigest, Hasher};
pub use keyed_lock::{KeyGuard, KeyedLocks};
pub use metastore::{Durability, StorageEngine, Store};
pub use metrics::{MetricsCollector, NoOpMetrics, SharedMetrics};
pub use pipeline::{
    DedupStore, DeleteReceipt, Download, StoreConfig, UploadReceipt, UploadRequest,
};
pub use ref_index::{Acquired, ReferenceEntry, ReferenceIndex, Released};
