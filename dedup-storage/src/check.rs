//! Consistency check between the blob store, the reference index and the
//! catalog. Read-only: nothing is repaired.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{info, warn};

use crate::blob_store::BlobInfo;
use crate::catalog::{FileFilter, FileId};
use crate::error::{DedupError, Result};
use crate::hasher::{hash_stream, ContentDigest};
use crate::pipeline::DedupStore;

/// A digest whose recorded reference count differs from the number of files
/// pointing at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountMismatch {
    pub digest: ContentDigest,
    pub recorded: u64,
    pub actual: u64,
}

impl CountMismatch {
    /// Fewer references recorded than files exist. Deleting one of the files
    /// could remove a blob that is still in use.
    pub fn is_undercount(&self) -> bool {
        self.recorded < self.actual
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub entries_checked: usize,
    pub blobs_checked: usize,
    pub files_checked: usize,
    /// Index entries without a stored payload
    pub missing_blobs: Vec<ContentDigest>,
    /// Stored payloads nothing references
    pub leaked_blobs: Vec<BlobInfo>,
    pub count_mismatches: Vec<CountMismatch>,
    /// Files whose digest has no index entry
    pub dangling_files: Vec<FileId>,
    /// Payloads that no longer hash to their digest
    pub corrupt_blobs: Vec<ContentDigest>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_blobs.is_empty()
            && self.leaked_blobs.is_empty()
            && self.count_mismatches.is_empty()
            && self.dangling_files.is_empty()
            && self.corrupt_blobs.is_empty()
    }

    /// Whether any finding can lose data, as opposed to only wasting space.
    pub fn has_violations(&self) -> bool {
        !self.missing_blobs.is_empty()
            || !self.dangling_files.is_empty()
            || !self.corrupt_blobs.is_empty()
            || self.count_mismatches.iter().any(CountMismatch::is_undercount)
    }
}

impl DedupStore {
    /// Cross-checks blobs, reference counts and file records. With
    /// `verify_content` every blob is read back and rehashed.
    pub async fn check(&self, verify_content: bool) -> Result<IntegrityReport> {
        let mut report = IntegrityReport::default();

        let entries: BTreeMap<ContentDigest, u64> = self
            .refs()
            .iter_entries()
            .map(|e| e.map(|e| (e.digest, e.ref_count)))
            .collect::<Result<_>>()?;
        report.entries_checked = entries.len();

        let blobs = self.blobs().list().await?;
        report.blobs_checked = blobs.len();
        let stored: BTreeSet<ContentDigest> = blobs.iter().map(|b| b.digest).collect();

        let mut actual: BTreeMap<ContentDigest, u64> = BTreeMap::new();
        for file in self.catalog().iter(FileFilter::default()) {
            let file = file?;
            report.files_checked += 1;
            *actual.entry(file.digest).or_default() += 1;
            if !entries.contains_key(&file.digest) {
                report.dangling_files.push(file.id);
            }
        }

        for (digest, recorded) in &entries {
            if !stored.contains(digest) {
                report.missing_blobs.push(*digest);
            }
            let files = actual.get(digest).copied().unwrap_or(0);
            if files != *recorded {
                report.count_mismatches.push(CountMismatch {
                    digest: *digest,
                    recorded: *recorded,
                    actual: files,
                });
            }
        }

        report.leaked_blobs = blobs
            .iter()
            .filter(|b| !entries.contains_key(&b.digest))
            .copied()
            .collect();

        if verify_content {
            for blob in &blobs {
                let reader = match self.blobs().get(&blob.digest).await {
                    Ok(reader) => reader,
                    // deleted while the check was running
                    Err(DedupError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                let (digest, _) = hash_stream(reader).await?;
                if digest != blob.digest {
                    warn!(expected = %blob.digest, actual = %digest, "blob content does not match its digest");
                    report.corrupt_blobs.push(blob.digest);
                }
            }
        }

        info!(
            entries = report.entries_checked,
            blobs = report.blobs_checked,
            files = report.files_checked,
            clean = report.is_clean(),
            "integrity check finished"
        );
        Ok(report)
    }
}
