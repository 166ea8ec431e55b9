//! Logical files and the indexes over them.
//!
//! Trees:
//!
//! | tree              | key                    | value          |
//! |-------------------|------------------------|----------------|
//! | `_FILES`          | file id                | [`FileRecord`] |
//! | `_OWNER_FILES`    | owner `\0` file id     | empty          |
//! | `_DIGEST_FILES`   | digest ++ file id      | empty          |
//! | `_OWNER_ACTIVITY` | owner                  | [`OwnerActivity`] |
//!
//! File ids are UUIDv7, so the byte order of `_FILES` is insertion order.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DedupError, MetaError, Result};
use crate::hasher::{ContentDigest, DIGEST_LEN};
use crate::keyed_lock::KeyedLocks;
use crate::metastore::{decode, encode, KvIter, MetaTreeExt, Store, WriteBatch};

pub(crate) const FILES_TREE: &str = "_FILES";
pub(crate) const OWNER_FILES_TREE: &str = "_OWNER_FILES";
pub(crate) const DIGEST_FILES_TREE: &str = "_DIGEST_FILES";
pub(crate) const OWNER_ACTIVITY_TREE: &str = "_OWNER_ACTIVITY";

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const ID_LEN: usize = 16;

/// Identifier of a logical file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    /// A fresh, time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    fn as_key(&self) -> &[u8; ID_LEN] {
        self.0.as_bytes()
    }

    fn from_key(raw: &[u8]) -> Option<Self> {
        Uuid::from_slice(raw).ok().map(Self)
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for FileId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl FromStr for FileId {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DedupError::InvalidInput(format!("file id '{s}': {e}")))
    }
}

/// A named, owned reference to a stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub mime_type: String,
    pub owner: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub download_count: u64,
    pub is_public: bool,
    pub digest: ContentDigest,
}

/// Input of [`FileCatalog::create`].
#[derive(Debug, Clone)]
pub struct NewFile {
    pub owner: String,
    pub name: String,
    pub mime_type: String,
    pub digest: ContentDigest,
    pub size: u64,
    /// The payload was already stored; counted as a dedup hit for the owner
    pub duplicate: bool,
}

/// Per-owner activity counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerActivity {
    pub owner: String,
    pub uploads: u64,
    pub downloads: u64,
    pub deletes: u64,
    pub dedup_hits: u64,
    pub last_active: DateTime<Utc>,
}

impl OwnerActivity {
    fn empty(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            uploads: 0,
            downloads: 0,
            deletes: 0,
            dedup_hits: 0,
            last_active: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Activity {
    Upload { duplicate: bool },
    Download,
    Delete,
}

/// Predicate over file records. Unset fields match everything; string matches
/// ignore case.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub owner: Option<String>,
    pub name_contains: Option<String>,
    pub mime_type_prefix: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
    pub uploader_contains: Option<String>,
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl FileFilter {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, file: &FileRecord) -> bool {
        if let Some(owner) = &self.owner {
            if &file.owner != owner {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !contains_ignore_case(&file.name, needle) {
                return false;
            }
        }
        if let Some(prefix) = &self.mime_type_prefix {
            if !file.mime_type.to_lowercase().starts_with(&prefix.to_lowercase()) {
                return false;
            }
        }
        if self.min_size.is_some_and(|min| file.size < min) {
            return false;
        }
        if self.max_size.is_some_and(|max| file.size > max) {
            return false;
        }
        if self.uploaded_after.is_some_and(|t| file.uploaded_at < t) {
            return false;
        }
        if self.uploaded_before.is_some_and(|t| file.uploaded_at > t) {
            return false;
        }
        if let Some(needle) = &self.uploader_contains {
            if !contains_ignore_case(&file.owner, needle) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Uploaded,
    Name,
    Size,
}

impl FromStr for SortKey {
    type Err = DedupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uploaded" | "date" => Ok(SortKey::Uploaded),
            "name" => Ok(SortKey::Name),
            "size" => Ok(SortKey::Size),
            other => Err(DedupError::InvalidInput(format!("unknown sort key '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub key: SortKey,
    pub descending: bool,
}

impl SortSpec {
    fn compare(&self, a: &FileRecord, b: &FileRecord) -> Ordering {
        let ord = match self.key {
            SortKey::Uploaded => a.uploaded_at.cmp(&b.uploaded_at),
            SortKey::Name => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            SortKey::Size => a.size.cmp(&b.size),
        }
        .then_with(|| a.id.cmp(&b.id));
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// Which slice of a listing to return.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    /// Continue after this file, as returned in [`FilePage::next_token`]
    pub start_after: Option<FileId>,
    pub limit: Option<usize>,
    pub sort: Option<SortSpec>,
}

#[derive(Debug, Clone)]
pub struct FilePage {
    pub files: Vec<FileRecord>,
    /// Set when more results follow
    pub next_token: Option<FileId>,
}

type RecordIter<'a> = Box<dyn Iterator<Item = Result<FileRecord>> + 'a>;

fn owner_prefix(owner: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner.len() + 1);
    key.extend_from_slice(owner.as_bytes());
    key.push(0);
    key
}

fn owner_key(owner: &str, id: &FileId) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    key.extend_from_slice(id.as_key());
    key
}

fn digest_key(digest: &ContentDigest, id: &FileId) -> Vec<u8> {
    let mut key = Vec::with_capacity(DIGEST_LEN + ID_LEN);
    key.extend_from_slice(digest.as_bytes());
    key.extend_from_slice(id.as_key());
    key
}

fn id_suffix(key: &[u8], tree: &'static str) -> Result<FileId> {
    key.len()
        .checked_sub(ID_LEN)
        .and_then(|start| FileId::from_key(&key[start..]))
        .ok_or_else(|| MetaError::MalformedKey(tree).into())
}

pub(crate) fn validate_owner(owner: &str) -> Result<()> {
    if owner.is_empty() {
        return Err(DedupError::InvalidInput("owner must not be empty".into()));
    }
    if owner.contains('\0') {
        return Err(DedupError::InvalidInput("owner must not contain NUL".into()));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DedupError::InvalidInput("file name must not be empty".into()));
    }
    Ok(name.to_string())
}

/// Owner-facing view of the stored files.
///
/// Every write that touches several trees goes through one metastore batch, so
/// a record and its index rows appear and disappear together. Writes to one
/// file are serialized by a per-file lock, activity updates by a per-owner
/// lock. When both are needed the file lock is taken first.
#[derive(Debug)]
pub struct FileCatalog {
    store: Arc<dyn Store>,
    files: Arc<dyn MetaTreeExt>,
    owner_files: Arc<dyn MetaTreeExt>,
    digest_files: Arc<dyn MetaTreeExt>,
    activity: Arc<dyn MetaTreeExt>,
    file_locks: KeyedLocks<FileId>,
    owner_locks: KeyedLocks<String>,
}

impl FileCatalog {
    pub fn new(store: Arc<dyn Store>) -> Result<Self, MetaError> {
        Ok(Self {
            files: store.tree_open(FILES_TREE)?,
            owner_files: store.tree_open(OWNER_FILES_TREE)?,
            digest_files: store.tree_open(DIGEST_FILES_TREE)?,
            activity: store.tree_open(OWNER_ACTIVITY_TREE)?,
            store,
            file_locks: KeyedLocks::new(),
            owner_locks: KeyedLocks::new(),
        })
    }

    /// Adds a record for an already referenced digest.
    pub async fn create(&self, new: NewFile) -> Result<FileRecord> {
        validate_owner(&new.owner)?;
        let name = validate_name(&new.name)?;
        let mime_type = match new.mime_type.trim() {
            "" => DEFAULT_MIME_TYPE.to_string(),
            m => m.to_string(),
        };

        // ids are minted under the owner lock so one owner's records commit
        // in id order
        let _owner = self.owner_locks.lock(new.owner.clone()).await;
        let record = FileRecord {
            id: FileId::new(),
            name,
            mime_type,
            owner: new.owner,
            size: new.size,
            uploaded_at: Utc::now(),
            download_count: 0,
            is_public: false,
            digest: new.digest,
        };

        let mut batch = self.store.batch();
        self.put_record(batch.as_mut(), &record)?;
        batch.insert(OWNER_FILES_TREE, &owner_key(&record.owner, &record.id), Vec::new())?;
        batch.insert(DIGEST_FILES_TREE, &digest_key(&record.digest, &record.id), Vec::new())?;
        self.bump_activity(
            batch.as_mut(),
            &record.owner,
            Activity::Upload {
                duplicate: new.duplicate,
            },
        )?;
        batch.commit()?;

        debug!(id = %record.id, owner = %record.owner, digest = %record.digest, "created file record");
        Ok(record)
    }

    /// Removes a record with its index rows and returns it so the caller can
    /// release its digest.
    pub async fn remove(&self, id: &FileId) -> Result<FileRecord> {
        let _file = self.file_locks.lock(*id).await;
        let record = self.get(id)?;

        let _owner = self.owner_locks.lock(record.owner.clone()).await;
        let mut batch = self.store.batch();
        batch.remove(FILES_TREE, id.as_key())?;
        batch.remove(OWNER_FILES_TREE, &owner_key(&record.owner, id))?;
        batch.remove(DIGEST_FILES_TREE, &digest_key(&record.digest, id))?;
        self.bump_activity(batch.as_mut(), &record.owner, Activity::Delete)?;
        batch.commit()?;

        debug!(%id, owner = %record.owner, "removed file record");
        Ok(record)
    }

    pub fn get(&self, id: &FileId) -> Result<FileRecord> {
        self.load(id)?
            .ok_or_else(|| DedupError::NotFound(format!("file {id}")))
    }

    pub fn contains(&self, id: &FileId) -> Result<bool> {
        Ok(self.files.contains_key(id.as_key())?)
    }

    /// All files of `owner`, oldest first.
    pub fn list_by_owner(&self, owner: &str) -> Result<Vec<FileRecord>> {
        self.iter(FileFilter::owner(owner)).collect()
    }

    /// All files pointing at `digest`.
    pub fn members_of(&self, digest: &ContentDigest) -> Result<Vec<FileRecord>> {
        self.index_records(self.digest_files.prefix(digest.as_bytes()), DIGEST_FILES_TREE)
            .collect()
    }

    /// Lazily yields the files matching `filter` in insertion order.
    pub fn iter(&self, filter: FileFilter) -> impl Iterator<Item = Result<FileRecord>> + '_ {
        self.iter_after(filter, None)
    }

    /// Like [`FileCatalog::iter`], resuming after `start_after`.
    ///
    /// Within one owner, records commit in id order, so a cursor never passes
    /// a record that is still being written. Across owners creates are not
    /// serialized: a global cursor can skip a record of another owner whose id
    /// is older than the cursor but which committed after the page was read.
    pub fn iter_after(
        &self,
        filter: FileFilter,
        start_after: Option<FileId>,
    ) -> impl Iterator<Item = Result<FileRecord>> + '_ {
        let source: RecordIter<'_> = match &filter.owner {
            Some(owner) => {
                let prefix = owner_prefix(owner);
                let rows = match start_after {
                    Some(id) => self.owner_files.range_after(&owner_key(owner, &id)),
                    None => self.owner_files.prefix(&prefix),
                };
                let rows: KvIter<'_> = Box::new(rows.take_while(move |row| match row {
                    Ok((key, _)) => key.starts_with(&prefix),
                    Err(_) => true,
                }));
                self.index_records(rows, OWNER_FILES_TREE)
            }
            None => {
                let rows = match start_after {
                    Some(id) => self.files.range_after(id.as_key()),
                    None => self.files.iter_all(),
                };
                Box::new(rows.map(|row| {
                    let (_, raw) = row?;
                    Ok(decode::<FileRecord>("file record", &raw)?)
                }))
            }
        };

        source.filter(move |item| match item {
            Ok(record) => filter.matches(record),
            Err(_) => true,
        })
    }

    /// One page of the files matching `filter`.
    ///
    /// Without a sort order the page is read lazily from the insertion-ordered
    /// index. With one, all matches are collected and sorted first.
    pub fn find(&self, filter: FileFilter, page: PageRequest) -> Result<FilePage> {
        let limit = page.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Err(DedupError::InvalidInput("page limit must be positive".into()));
        }

        let Some(sort) = page.sort else {
            let mut files = Vec::new();
            let mut next_token = None;
            for item in self.iter_after(filter, page.start_after) {
                let record = item?;
                if files.len() == limit {
                    next_token = files.last().map(|f: &FileRecord| f.id);
                    break;
                }
                files.push(record);
            }
            return Ok(FilePage { files, next_token });
        };

        let mut all = self.iter(filter).collect::<Result<Vec<_>>>()?;
        all.sort_by(|a, b| sort.compare(a, b));

        let start = match page.start_after {
            Some(token) => {
                all.iter()
                    .position(|f| f.id == token)
                    .ok_or_else(|| DedupError::InvalidInput(format!("unknown page token {token}")))?
                    + 1
            }
            None => 0,
        };
        let rest = all.len().saturating_sub(start);
        let files: Vec<FileRecord> = all.into_iter().skip(start).take(limit).collect();
        let next_token = if rest > files.len() {
            files.last().map(|f| f.id)
        } else {
            None
        };
        Ok(FilePage { files, next_token })
    }

    /// Counts a download of the file and of its owner. Fails with `NotFound`
    /// if the file was removed meanwhile.
    pub async fn record_download(&self, id: &FileId) -> Result<FileRecord> {
        let _file = self.file_locks.lock(*id).await;
        let mut record = self.get(id)?;
        record.download_count += 1;

        let _owner = self.owner_locks.lock(record.owner.clone()).await;
        let mut batch = self.store.batch();
        self.put_record(batch.as_mut(), &record)?;
        self.bump_activity(batch.as_mut(), &record.owner, Activity::Download)?;
        batch.commit()?;
        Ok(record)
    }

    pub async fn rename(&self, id: &FileId, name: &str) -> Result<FileRecord> {
        let name = validate_name(name)?;
        self.update(id, |record| record.name = name).await
    }

    pub async fn set_visibility(&self, id: &FileId, public: bool) -> Result<FileRecord> {
        self.update(id, |record| record.is_public = public).await
    }

    /// Activity counters of `owner`, `None` if the owner never did anything.
    pub fn activity(&self, owner: &str) -> Result<Option<OwnerActivity>> {
        match self.activity.get(owner.as_bytes())? {
            Some(raw) => Ok(Some(decode("owner activity", &raw)?)),
            None => Ok(None),
        }
    }

    /// Activity of every owner, ordered by owner.
    pub fn all_activity(&self) -> Result<Vec<OwnerActivity>> {
        self.activity
            .iter_all()
            .map(|row| {
                let (_, raw) = row?;
                Ok(decode("owner activity", &raw)?)
            })
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.store.num_keys(FILES_TREE)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.files.iter_all().next().transpose()?.is_none())
    }

    async fn update<F>(&self, id: &FileId, apply: F) -> Result<FileRecord>
    where
        F: FnOnce(&mut FileRecord),
    {
        let _file = self.file_locks.lock(*id).await;
        let mut record = self.get(id)?;
        apply(&mut record);
        self.files
            .insert(id.as_key(), encode("file record", &record)?)?;
        Ok(record)
    }

    fn load(&self, id: &FileId) -> Result<Option<FileRecord>> {
        match self.files.get(id.as_key())? {
            Some(raw) => Ok(Some(decode("file record", &raw)?)),
            None => Ok(None),
        }
    }

    fn put_record(&self, batch: &mut dyn WriteBatch, record: &FileRecord) -> Result<()> {
        batch.insert(FILES_TREE, record.id.as_key(), encode("file record", record)?)?;
        Ok(())
    }

    /// Stages the activity update of `owner` into `batch`. The caller holds the
    /// owner's lock until the batch is committed.
    fn bump_activity(
        &self,
        batch: &mut dyn WriteBatch,
        owner: &str,
        event: Activity,
    ) -> Result<()> {
        let mut activity = self
            .activity(owner)?
            .unwrap_or_else(|| OwnerActivity::empty(owner));
        match event {
            Activity::Upload { duplicate } => {
                activity.uploads += 1;
                if duplicate {
                    activity.dedup_hits += 1;
                }
            }
            Activity::Download => activity.downloads += 1,
            Activity::Delete => activity.deletes += 1,
        }
        activity.last_active = Utc::now();
        batch.insert(
            OWNER_ACTIVITY_TREE,
            owner.as_bytes(),
            encode("owner activity", &activity)?,
        )?;
        Ok(())
    }

    /// Resolves index rows whose key ends in a file id into records.
    fn index_records<'a>(&'a self, rows: KvIter<'a>, tree: &'static str) -> RecordIter<'a> {
        Box::new(rows.filter_map(move |row| {
            let result = row
                .map_err(DedupError::from)
                .and_then(|(key, _)| id_suffix(&key, tree))
                .and_then(|id| Ok((id, self.load(&id)?)));
            match result {
                Ok((_, Some(record))) => Some(Ok(record)),
                Ok((id, None)) => {
                    // the record was removed between reading the index and loading it
                    warn!(%id, tree, "index row without file record");
                    None
                }
                Err(e) => Some(Err(e)),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::digest_bytes;
    use crate::metastore::MemoryStore;

    fn catalog() -> FileCatalog {
        FileCatalog::new(Arc::new(MemoryStore::new())).unwrap()
    }

    fn new_file(owner: &str, name: &str, payload: &[u8]) -> NewFile {
        NewFile {
            owner: owner.to_string(),
            name: name.to_string(),
            mime_type: "text/plain".to_string(),
            digest: digest_bytes(payload),
            size: payload.len() as u64,
            duplicate: false,
        }
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let cat = catalog();
        let rec = cat.create(new_file("alice", " a.txt ", b"hello")).await.unwrap();
        assert_eq!(rec.name, "a.txt");
        assert_eq!(cat.get(&rec.id).unwrap(), rec);
        assert_eq!(cat.members_of(&rec.digest).unwrap(), vec![rec.clone()]);

        let removed = cat.remove(&rec.id).await.unwrap();
        assert_eq!(removed, rec);
        assert!(matches!(cat.get(&rec.id), Err(DedupError::NotFound(_))));
        assert!(cat.members_of(&rec.digest).unwrap().is_empty());
        assert!(cat.list_by_owner("alice").unwrap().is_empty());
        assert!(matches!(
            cat.remove(&rec.id).await,
            Err(DedupError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_commit_in_id_order() {
        let cat = Arc::new(catalog());
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let cat = Arc::clone(&cat);
                tokio::spawn(async move {
                    let name = format!("f{i}");
                    cat.create(new_file("alice", &name, name.as_bytes())).await.unwrap()
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        let listed: Vec<FileId> = cat
            .iter(FileFilter::owner("alice"))
            .map(|r| r.unwrap().id)
            .collect();
        let mut sorted = listed.clone();
        sorted.sort();
        assert_eq!(listed.len(), 32);
        assert_eq!(listed, sorted);

        let mut paged = Vec::new();
        let mut token = None;
        loop {
            let page = cat
                .find(
                    FileFilter::owner("alice"),
                    PageRequest {
                        limit: Some(5),
                        start_after: token,
                        ..Default::default()
                    },
                )
                .unwrap();
            paged.extend(page.files.iter().map(|f| f.id));
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        assert_eq!(paged, listed);
    }

    #[tokio::test]
    async fn test_validation() {
        let cat = catalog();
        assert!(matches!(
            cat.create(new_file("", "a", b"x")).await,
            Err(DedupError::InvalidInput(_))
        ));
        assert!(matches!(
            cat.create(new_file("a\0b", "a", b"x")).await,
            Err(DedupError::InvalidInput(_))
        ));
        assert!(matches!(
            cat.create(new_file("alice", "   ", b"x")).await,
            Err(DedupError::InvalidInput(_))
        ));
        assert!(cat.is_empty().unwrap());

        let mut blank_mime = new_file("alice", "a", b"x");
        blank_mime.mime_type = String::new();
        let rec = cat.create(blank_mime).await.unwrap();
        assert_eq!(rec.mime_type, DEFAULT_MIME_TYPE);
    }

    #[tokio::test]
    async fn test_owner_listing_is_isolated_and_ordered() {
        let cat = catalog();
        let a1 = cat.create(new_file("al", "1", b"1")).await.unwrap();
        let _b = cat.create(new_file("alice", "2", b"2")).await.unwrap();
        let a2 = cat.create(new_file("al", "3", b"3")).await.unwrap();

        let ids: Vec<FileId> = cat
            .list_by_owner("al")
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec![a1.id, a2.id]);
    }

    #[tokio::test]
    async fn test_find_pages_with_cursor() {
        let cat = catalog();
        let mut ids = Vec::new();
        for i in 0..5u8 {
            ids.push(cat.create(new_file("bob", &format!("f{i}"), &[i])).await.unwrap().id);
        }

        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = cat
                .find(
                    FileFilter::owner("bob"),
                    PageRequest {
                        start_after: token,
                        limit: Some(2),
                        sort: None,
                    },
                )
                .unwrap();
            seen.extend(page.files.iter().map(|f| f.id));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(seen, ids);

        // an insert after the cursor shows up in later pages
        let page = cat
            .find(
                FileFilter::default(),
                PageRequest {
                    start_after: Some(ids[4]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(page.files.is_empty());
        let late = cat.create(new_file("bob", "late", b"late")).await.unwrap();
        let page = cat
            .find(
                FileFilter::default(),
                PageRequest {
                    start_after: Some(ids[4]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(page.files, vec![late]);
    }

    #[tokio::test]
    async fn test_filters() {
        let cat = catalog();
        let mut img = new_file("carol@example.com", "Holiday.PNG", &[0u8; 100]);
        img.mime_type = "image/png".into();
        let img = cat.create(img).await.unwrap();
        let doc = cat.create(new_file("dave", "notes.txt", &[1u8; 10])).await.unwrap();

        let find = |filter: FileFilter| -> Vec<FileId> {
            cat.find(filter, PageRequest::default())
                .unwrap()
                .files
                .into_iter()
                .map(|f| f.id)
                .collect()
        };

        assert_eq!(
            find(FileFilter {
                name_contains: Some("holiday".into()),
                ..Default::default()
            }),
            vec![img.id]
        );
        assert_eq!(
            find(FileFilter {
                mime_type_prefix: Some("IMAGE/".into()),
                ..Default::default()
            }),
            vec![img.id]
        );
        assert_eq!(
            find(FileFilter {
                max_size: Some(50),
                ..Default::default()
            }),
            vec![doc.id]
        );
        assert_eq!(
            find(FileFilter {
                min_size: Some(10),
                max_size: Some(100),
                ..Default::default()
            }),
            vec![img.id, doc.id]
        );
        assert_eq!(
            find(FileFilter {
                uploader_contains: Some("EXAMPLE".into()),
                ..Default::default()
            }),
            vec![img.id]
        );
        assert!(find(FileFilter {
            uploaded_after: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        })
        .is_empty());
    }

    #[tokio::test]
    async fn test_sorted_find() {
        let cat = catalog();
        let big = cat.create(new_file("eve", "b", &[0u8; 30])).await.unwrap();
        let small = cat.create(new_file("eve", "c", &[0u8; 10])).await.unwrap();
        let mid = cat.create(new_file("eve", "a", &[0u8; 20])).await.unwrap();

        let sort = Some(SortSpec {
            key: SortKey::Size,
            descending: true,
        });
        let first = cat
            .find(
                FileFilter::default(),
                PageRequest {
                    start_after: None,
                    limit: Some(2),
                    sort,
                },
            )
            .unwrap();
        assert_eq!(first.files, vec![big.clone(), mid.clone()]);
        assert_eq!(first.next_token, Some(mid.id));

        let second = cat
            .find(
                FileFilter::default(),
                PageRequest {
                    start_after: first.next_token,
                    limit: Some(2),
                    sort,
                },
            )
            .unwrap();
        assert_eq!(second.files, vec![small]);
        assert_eq!(second.next_token, None);

        let by_name = cat
            .find(
                FileFilter::default(),
                PageRequest {
                    sort: Some(SortSpec {
                        key: SortKey::Name,
                        descending: false,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(by_name.files[0], mid);
    }

    #[tokio::test]
    async fn test_activity_counters() {
        let cat = catalog();
        let rec = cat.create(new_file("frank", "a", b"x")).await.unwrap();
        let mut dup = new_file("frank", "b", b"x");
        dup.duplicate = true;
        cat.create(dup).await.unwrap();

        let downloaded = cat.record_download(&rec.id).await.unwrap();
        assert_eq!(downloaded.download_count, 1);
        cat.remove(&rec.id).await.unwrap();

        let activity = cat.activity("frank").unwrap().unwrap();
        assert_eq!(activity.uploads, 2);
        assert_eq!(activity.dedup_hits, 1);
        assert_eq!(activity.downloads, 1);
        assert_eq!(activity.deletes, 1);
        assert!(cat.activity("nobody").unwrap().is_none());
        assert_eq!(cat.all_activity().unwrap().len(), 1);

        assert!(matches!(
            cat.record_download(&rec.id).await,
            Err(DedupError::NotFound(_))
        ));
        assert!(!cat.contains(&rec.id).unwrap());
    }

    #[tokio::test]
    async fn test_rename_and_visibility() {
        let cat = catalog();
        let rec = cat.create(new_file("gina", "old", b"x")).await.unwrap();

        let renamed = cat.rename(&rec.id, "new").await.unwrap();
        assert_eq!(renamed.name, "new");
        assert_eq!(renamed.digest, rec.digest);
        assert!(matches!(
            cat.rename(&rec.id, "").await,
            Err(DedupError::InvalidInput(_))
        ));

        let public = cat.set_visibility(&rec.id, true).await.unwrap();
        assert!(public.is_public);
        assert_eq!(cat.get(&rec.id).unwrap().name, "new");
    }

    #[test]
    fn test_file_id_parse() {
        let id = FileId::new();
        assert_eq!(id.to_string().parse::<FileId>().unwrap(), id);
        assert!(matches!(
            "not-a-uuid".parse::<FileId>(),
            Err(DedupError::InvalidInput(_))
        ));
    }
}
