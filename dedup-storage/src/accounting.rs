//! Read-only views derived from the catalog and the reference index.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::catalog::{FileFilter, FileId, FileRecord, OwnerActivity, PageRequest};
use crate::error::Result;
use crate::hasher::ContentDigest;
use crate::pipeline::DedupStore;

/// Which files an aggregate covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Owner(String),
}

impl Scope {
    fn filter(&self) -> FileFilter {
        match self {
            Scope::Global => FileFilter::default(),
            Scope::Owner(owner) => FileFilter::owner(owner.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_files: u64,
    /// Distinct digests among the files
    pub unique_files: u64,
    pub duplicate_files: u64,
    pub total_logical_size: u64,
    pub actual_stored_size: u64,
    pub saved_space: u64,
    /// `saved_space` as a percentage of `total_logical_size`
    pub savings_percentage: f64,
}

impl StorageStats {
    pub fn new(total_files: u64, unique_files: u64, logical: u64, stored: u64) -> Self {
        let saved_space = logical.saturating_sub(stored);
        let savings_percentage = if logical == 0 {
            0.0
        } else {
            saved_space as f64 / logical as f64 * 100.0
        };
        Self {
            total_files,
            unique_files,
            duplicate_files: total_files.saturating_sub(unique_files),
            total_logical_size: logical,
            actual_stored_size: stored,
            saved_space,
            savings_percentage,
        }
    }
}

/// Files sharing one payload.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub digest: ContentDigest,
    pub size: u64,
    pub ref_count: u64,
    pub members: Vec<FileRecord>,
}

/// A file with the sharing information of its payload.
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub file: FileRecord,
    pub ref_count: u64,
    pub is_deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileListing {
    pub files: Vec<FileSummary>,
    pub next_token: Option<FileId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnerReport {
    pub owner: String,
    pub stats: StorageStats,
    pub activity: OwnerActivity,
}

/// Activity summed over all owners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityTotals {
    pub owners: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub deletes: u64,
    pub dedup_hits: u64,
}

impl DedupStore {
    pub fn stats(&self, scope: &Scope) -> Result<StorageStats> {
        let mut total_files = 0u64;
        let mut logical = 0u64;
        let mut digests: BTreeMap<ContentDigest, u64> = BTreeMap::new();
        for file in self.catalog().iter(scope.filter()) {
            let file = file?;
            total_files += 1;
            logical += file.size;
            digests.entry(file.digest).or_insert(file.size);
        }

        let mut stored = 0u64;
        for (digest, file_size) in &digests {
            stored += match self.refs().get_entry(digest)? {
                Some(entry) => entry.size,
                None => {
                    warn!(%digest, "file references a digest without an index entry");
                    *file_size
                }
            };
        }

        Ok(StorageStats::new(
            total_files,
            digests.len() as u64,
            logical,
            stored,
        ))
    }

    /// Digests referenced more than once. For an owner scope these are the
    /// owner's digests that are shared with anyone, listing only the owner's
    /// files.
    pub fn duplicate_groups(&self, scope: &Scope) -> Result<Vec<DuplicateGroup>> {
        let mut groups = Vec::new();
        match scope {
            Scope::Global => {
                for entry in self.refs().iter_entries() {
                    let entry = entry?;
                    if entry.ref_count <= 1 {
                        continue;
                    }
                    let members = self.catalog().members_of(&entry.digest)?;
                    if members.is_empty() {
                        continue;
                    }
                    groups.push(DuplicateGroup {
                        digest: entry.digest,
                        size: entry.size,
                        ref_count: entry.ref_count,
                        members,
                    });
                }
            }
            Scope::Owner(owner) => {
                let mut by_digest: BTreeMap<ContentDigest, Vec<FileRecord>> = BTreeMap::new();
                for file in self.catalog().iter(FileFilter::owner(owner.clone())) {
                    let file = file?;
                    by_digest.entry(file.digest).or_default().push(file);
                }
                for (digest, members) in by_digest {
                    let Some(entry) = self.refs().get_entry(&digest)? else {
                        continue;
                    };
                    if entry.ref_count > 1 {
                        groups.push(DuplicateGroup {
                            digest,
                            size: entry.size,
                            ref_count: entry.ref_count,
                            members,
                        });
                    }
                }
            }
        }
        Ok(groups)
    }

    /// Whether the payload of `file` is shared with another file.
    pub fn is_deduplicated(&self, file: &FileRecord) -> Result<bool> {
        Ok(self.ref_count_of(&file.digest)? > 1)
    }

    pub fn summarize(&self, file: FileRecord) -> Result<FileSummary> {
        let ref_count = self.ref_count_of(&file.digest)?;
        Ok(FileSummary {
            file,
            ref_count,
            is_deduplicated: ref_count > 1,
        })
    }

    pub fn file_info(&self, id: &FileId) -> Result<FileSummary> {
        let file = self.catalog().get(id)?;
        self.summarize(file)
    }

    /// A page of files with their sharing information.
    pub fn list_files(&self, filter: FileFilter, page: PageRequest) -> Result<FileListing> {
        let page = self.catalog().find(filter, page)?;
        let files = page
            .files
            .into_iter()
            .map(|file| self.summarize(file))
            .collect::<Result<Vec<_>>>()?;
        Ok(FileListing {
            files,
            next_token: page.next_token,
        })
    }

    /// Storage and activity of every owner that ever uploaded.
    pub fn owner_report(&self) -> Result<Vec<OwnerReport>> {
        self.catalog()
            .all_activity()?
            .into_iter()
            .map(|activity| {
                let stats = self.stats(&Scope::Owner(activity.owner.clone()))?;
                Ok(OwnerReport {
                    owner: activity.owner.clone(),
                    stats,
                    activity,
                })
            })
            .collect()
    }

    pub fn activity_totals(&self) -> Result<ActivityTotals> {
        let mut totals = ActivityTotals::default();
        for activity in self.catalog().all_activity()? {
            totals.owners += 1;
            totals.uploads += activity.uploads;
            totals.downloads += activity.downloads;
            totals.deletes += activity.deletes;
            totals.dedup_hits += activity.dedup_hits;
        }
        Ok(totals)
    }

    fn ref_count_of(&self, digest: &ContentDigest) -> Result<u64> {
        Ok(self
            .refs()
            .get_entry(digest)?
            .map(|e| e.ref_count)
            .unwrap_or(0))
    }
}
