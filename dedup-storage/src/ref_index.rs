use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{DedupError, MetaError, Result};
use crate::hasher::ContentDigest;
use crate::keyed_lock::{KeyGuard, KeyedLocks};
use crate::metastore::{decode, encode, MetaTreeExt, Store};
use crate::metrics::SharedMetrics;

pub(crate) const REFS_TREE: &str = "_REFS";

/// Reference count of one stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub digest: ContentDigest,
    pub ref_count: u64,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// No reference existed before this acquire
    pub is_new: bool,
    pub ref_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub ref_count: u64,
    /// The last reference is gone and the payload may be deleted
    pub should_delete_blob: bool,
}

/// Guard proving the caller holds the lock of one digest.
pub type DigestGuard = KeyGuard<ContentDigest>;

/// Reference counts per digest, persisted in the `_REFS` tree.
///
/// Mutations of one digest are serialized through a keyed lock table; work on
/// different digests proceeds in parallel. The `*_locked` variants take a
/// guard obtained from [`ReferenceIndex::lock`] so a caller can hold the lock
/// across several steps.
#[derive(Debug)]
pub struct ReferenceIndex {
    tree: Arc<dyn MetaTreeExt>,
    locks: KeyedLocks<ContentDigest>,
    metrics: SharedMetrics,
}

impl ReferenceIndex {
    pub fn new(store: &dyn Store, metrics: SharedMetrics) -> Result<Self, MetaError> {
        Ok(Self {
            tree: store.tree_open(REFS_TREE)?,
            locks: KeyedLocks::new(),
            metrics,
        })
    }

    /// Takes the lock of `digest`.
    pub async fn lock(&self, digest: ContentDigest) -> DigestGuard {
        self.locks.lock(digest).await
    }

    /// Number of digests whose lock is currently held or awaited.
    pub fn locks_in_use(&self) -> usize {
        self.locks.active()
    }

    pub async fn acquire(&self, digest: &ContentDigest, size: u64) -> Result<Acquired> {
        let guard = self.lock(*digest).await;
        self.acquire_locked(&guard, size)
    }

    /// Adds one reference to the guarded digest, creating the entry if needed.
    pub fn acquire_locked(&self, guard: &DigestGuard, size: u64) -> Result<Acquired> {
        let digest = guard.key();
        let entry = match self.load(digest)? {
            Some(mut entry) => {
                if entry.size != size {
                    warn!(%digest, recorded = entry.size, size, "size differs for known digest");
                }
                entry.ref_count = entry.ref_count.checked_add(1).ok_or_else(|| {
                    self.violation(format!("reference count overflow for {digest}"))
                })?;
                entry
            }
            None => ReferenceEntry {
                digest: *digest,
                ref_count: 1,
                size,
                created_at: Utc::now(),
            },
        };
        self.store(&entry)?;

        debug!(%digest, ref_count = entry.ref_count, "acquired reference");
        Ok(Acquired {
            is_new: entry.ref_count == 1,
            ref_count: entry.ref_count,
        })
    }

    pub async fn release(&self, digest: &ContentDigest) -> Result<Released> {
        let guard = self.lock(*digest).await;
        self.release_locked(&guard)
    }

    /// Drops one reference from the guarded digest. Releasing a digest without
    /// an entry is an invariant violation and changes nothing.
    pub fn release_locked(&self, guard: &DigestGuard) -> Result<Released> {
        let digest = guard.key();
        let Some(mut entry) = self.load(digest)? else {
            return Err(self.violation(format!("release of unreferenced digest {digest}")));
        };

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            self.tree.remove(digest.as_bytes())?;
            debug!(%digest, "released last reference");
            Ok(Released {
                ref_count: 0,
                should_delete_blob: true,
            })
        } else {
            self.store(&entry)?;
            debug!(%digest, ref_count = entry.ref_count, "released reference");
            Ok(Released {
                ref_count: entry.ref_count,
                should_delete_blob: false,
            })
        }
    }

    /// Current count of `digest`; `NotFound` if nothing references it.
    pub fn peek(&self, digest: &ContentDigest) -> Result<u64> {
        self.get_entry(digest)?
            .map(|e| e.ref_count)
            .ok_or_else(|| DedupError::NotFound(format!("digest {digest}")))
    }

    pub fn get_entry(&self, digest: &ContentDigest) -> Result<Option<ReferenceEntry>> {
        self.load(digest)
    }

    /// Iterates over all entries in digest order.
    pub fn iter_entries(&self) -> impl Iterator<Item = Result<ReferenceEntry>> + '_ {
        self.tree.iter_all().map(|item| {
            let (_, raw) = item?;
            Ok(decode::<ReferenceEntry>("reference entry", &raw)?)
        })
    }

    pub fn entries(&self) -> Result<Vec<ReferenceEntry>> {
        self.iter_entries().collect()
    }

    pub fn len(&self) -> Result<usize> {
        let mut n = 0;
        for item in self.tree.iter_all() {
            item?;
            n += 1;
        }
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.tree.iter_all().next().transpose()?.is_none())
    }

    fn load(&self, digest: &ContentDigest) -> Result<Option<ReferenceEntry>> {
        match self.tree.get(digest.as_bytes())? {
            Some(raw) => Ok(Some(decode("reference entry", &raw)?)),
            None => Ok(None),
        }
    }

    fn store(&self, entry: &ReferenceEntry) -> Result<()> {
        let raw = encode("reference entry", entry)?;
        self.tree.insert(entry.digest.as_bytes(), raw)?;
        Ok(())
    }

    fn violation(&self, msg: String) -> DedupError {
        error!("{msg}");
        self.metrics.invariant_violation();
        DedupError::InvariantViolation(msg)
    }
}
