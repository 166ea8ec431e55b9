use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{Stream, TryStreamExt};
use hyper::body::Frame;
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use dedup_storage::{
    ActivityTotals, ByteStream, ContentDigest, DedupError, DedupStore, DeleteReceipt,
    DuplicateGroup, FileId, FileRecord, FileSummary, OwnerReport, Result, Scope, StorageStats,
    UploadReceipt,
};

use super::query::QueryParams;
use super::responses::{self, io_error};
use super::HttpBody;

#[derive(Debug, Serialize)]
pub struct FileView {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub owner: String,
    pub size: u64,
    pub hash: String,
    pub uploaded_at: String,
    pub download_count: u64,
    pub is_public: bool,
}

impl From<&FileRecord> for FileView {
    fn from(file: &FileRecord) -> Self {
        Self {
            id: file.id.to_string(),
            name: file.name.clone(),
            mime_type: file.mime_type.clone(),
            owner: file.owner.clone(),
            size: file.size,
            hash: file.digest.to_hex(),
            uploaded_at: format_timestamp(file.uploaded_at),
            download_count: file.download_count,
            is_public: file.is_public,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileSummaryView {
    #[serde(flatten)]
    pub file: FileView,
    pub ref_count: u64,
    pub is_deduplicated: bool,
}

impl From<&FileSummary> for FileSummaryView {
    fn from(summary: &FileSummary) -> Self {
        Self {
            file: FileView::from(&summary.file),
            ref_count: summary.ref_count,
            is_deduplicated: summary.is_deduplicated,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileListView {
    pub files: Vec<FileSummaryView>,
    pub count: usize,
    pub has_more: bool,
    pub next_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadView {
    pub file: FileView,
    pub hash: String,
    pub size: u64,
    pub duplicate: bool,
    pub ref_count: u64,
    pub saved_bytes: u64,
}

impl From<&UploadReceipt> for UploadView {
    fn from(receipt: &UploadReceipt) -> Self {
        Self {
            file: FileView::from(&receipt.file),
            hash: receipt.digest.to_hex(),
            size: receipt.size,
            duplicate: receipt.was_duplicate,
            ref_count: receipt.ref_count,
            saved_bytes: receipt.saved_bytes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteView {
    pub id: String,
    pub hash: String,
    pub ref_count: u64,
    pub blob_deleted: bool,
}

impl From<&DeleteReceipt> for DeleteView {
    fn from(receipt: &DeleteReceipt) -> Self {
        Self {
            id: receipt.file.id.to_string(),
            hash: receipt.file.digest.to_hex(),
            ref_count: receipt.ref_count,
            blob_deleted: receipt.blob_deleted,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DuplicateGroupView {
    pub hash: String,
    pub size: u64,
    pub ref_count: u64,
    pub wasted_bytes: u64,
    pub members: Vec<FileView>,
}

impl From<&DuplicateGroup> for DuplicateGroupView {
    fn from(group: &DuplicateGroup) -> Self {
        Self {
            hash: group.digest.to_hex(),
            size: group.size,
            ref_count: group.ref_count,
            wasted_bytes: group.size.saturating_mul(group.ref_count.saturating_sub(1)),
            members: group.members.iter().map(FileView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsView {
    pub scope: String,
    #[serde(flatten)]
    pub stats: StorageStats,
    pub activity: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct OwnerView {
    pub owner: String,
    pub stats: StorageStats,
    pub uploads: u64,
    pub downloads: u64,
    pub deletes: u64,
    pub dedup_hits: u64,
    pub last_active: String,
}

impl From<&OwnerReport> for OwnerView {
    fn from(report: &OwnerReport) -> Self {
        Self {
            owner: report.owner.clone(),
            stats: report.stats.clone(),
            uploads: report.activity.uploads,
            downloads: report.activity.downloads,
            deletes: report.activity.deletes,
            dedup_hits: report.activity.dedup_hits,
            last_active: format_timestamp(report.activity.last_active),
        }
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Adapts a request body into the store's byte stream.
pub fn body_stream<S, E>(frames: S) -> ByteStream
where
    S: Stream<Item = std::result::Result<Frame<Bytes>, E>> + Send + 'static,
    E: std::fmt::Display + 'static,
{
    Box::pin(
        frames
            .map_err(io_error)
            .try_filter_map(|frame| futures::future::ok(frame.into_data().ok())),
    )
}

pub async fn upload(
    store: &DedupStore,
    query: &QueryParams,
    mime_type: Option<&str>,
    content_length: Option<u64>,
    body: ByteStream,
) -> Result<Response<HttpBody>> {
    let owner = query.require("owner")?;
    let name = query.require("name")?;
    let mime_type = query.get("mime").or(mime_type).unwrap_or_default();

    let receipt = store
        .upload(owner, name, mime_type, body, content_length)
        .await?;
    debug!(id = %receipt.file.id, duplicate = receipt.was_duplicate, "upload accepted");
    Ok(responses::json_response(
        StatusCode::CREATED,
        &UploadView::from(&receipt),
    ))
}

pub fn list_files(store: &DedupStore, query: &QueryParams) -> Result<Response<HttpBody>> {
    let filter = query.file_filter()?;
    let page = query.page_request()?;
    let listing = store.list_files(filter, page)?;

    let files: Vec<FileSummaryView> = listing.files.iter().map(FileSummaryView::from).collect();
    let view = FileListView {
        count: files.len(),
        has_more: listing.next_token.is_some(),
        next_token: listing.next_token.map(|id| id.to_string()),
        files,
    };
    Ok(responses::json_response(StatusCode::OK, &view))
}

pub fn file_info(store: &DedupStore, id: &str) -> Result<Response<HttpBody>> {
    let id: FileId = id.parse()?;
    let summary = store.file_info(&id)?;
    Ok(responses::json_response(
        StatusCode::OK,
        &FileSummaryView::from(&summary),
    ))
}

pub async fn download(store: &DedupStore, id: &str) -> Result<Response<HttpBody>> {
    let id: FileId = id.parse()?;
    let download = store.download(&id).await?;
    Ok(responses::content_response(
        download.content,
        &download.file.mime_type,
        Some(&download.file.name),
    ))
}

pub async fn download_blob(store: &DedupStore, digest: &str) -> Result<Response<HttpBody>> {
    let digest: ContentDigest = digest.parse()?;
    let reader = store.download_by_digest(&digest).await?;
    Ok(responses::content_response(
        reader,
        "application/octet-stream",
        None,
    ))
}

pub async fn delete(store: &DedupStore, id: &str) -> Result<Response<HttpBody>> {
    let id: FileId = id.parse()?;
    let receipt = store.delete(&id).await?;
    Ok(responses::json_response(
        StatusCode::OK,
        &DeleteView::from(&receipt),
    ))
}

pub async fn rename(store: &DedupStore, id: &str, query: &QueryParams) -> Result<Response<HttpBody>> {
    let id: FileId = id.parse()?;
    let file = store.rename(&id, query.require("name")?).await?;
    Ok(responses::json_response(StatusCode::OK, &FileView::from(&file)))
}

pub async fn set_visibility(
    store: &DedupStore,
    id: &str,
    query: &QueryParams,
) -> Result<Response<HttpBody>> {
    let id: FileId = id.parse()?;
    let public = query
        .flag("public")?
        .ok_or_else(|| DedupError::InvalidInput("missing query parameter 'public'".into()))?;
    let file = store.set_visibility(&id, public).await?;
    Ok(responses::json_response(StatusCode::OK, &FileView::from(&file)))
}

pub fn stats(store: &DedupStore, query: &QueryParams) -> Result<Response<HttpBody>> {
    let view = match query.get("owner") {
        Some(owner) => {
            let stats = store.stats(&Scope::Owner(owner.to_string()))?;
            let activity = store.catalog().activity(owner)?;
            StatsView {
                scope: owner.to_string(),
                stats,
                activity: to_value(&activity),
            }
        }
        None => {
            let stats = store.stats(&Scope::Global)?;
            let totals: ActivityTotals = store.activity_totals()?;
            StatsView {
                scope: "global".to_string(),
                stats,
                activity: to_value(&totals),
            }
        }
    };
    Ok(responses::json_response(StatusCode::OK, &view))
}

pub fn owners(store: &DedupStore) -> Result<Response<HttpBody>> {
    let report = store.owner_report()?;
    let owners: Vec<OwnerView> = report.iter().map(OwnerView::from).collect();
    Ok(responses::json_response(StatusCode::OK, &owners))
}

pub fn duplicates(store: &DedupStore, query: &QueryParams) -> Result<Response<HttpBody>> {
    let scope = match query.get("owner") {
        Some(owner) => Scope::Owner(owner.to_string()),
        None => Scope::Global,
    };
    let groups = store.duplicate_groups(&scope)?;
    let groups: Vec<DuplicateGroupView> = groups.iter().map(DuplicateGroupView::from).collect();
    Ok(responses::json_response(StatusCode::OK, &groups))
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedup_storage::digest_bytes;

    fn record(name: &str) -> FileRecord {
        FileRecord {
            id: FileId::new(),
            name: name.to_string(),
            mime_type: "text/plain".to_string(),
            owner: "alice".to_string(),
            size: 5,
            uploaded_at: DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            download_count: 2,
            is_public: false,
            digest: digest_bytes(b"hello"),
        }
    }

    #[test]
    fn test_file_view_uses_hex_and_rfc3339() {
        let file = record("a.txt");
        let view = FileView::from(&file);
        assert_eq!(view.hash, digest_bytes(b"hello").to_hex());
        assert_eq!(view.uploaded_at, "2024-03-01T12:00:00Z");
        assert_eq!(view.id, file.id.to_string());
    }

    #[test]
    fn test_summary_view_is_flat() {
        let summary = FileSummary {
            file: record("a.txt"),
            ref_count: 3,
            is_deduplicated: true,
        };
        let value = serde_json::to_value(FileSummaryView::from(&summary)).unwrap();
        assert_eq!(value["name"], "a.txt");
        assert_eq!(value["ref_count"], 3);
        assert_eq!(value["is_deduplicated"], true);
    }

    #[test]
    fn test_duplicate_group_wasted_bytes() {
        let group = DuplicateGroup {
            digest: digest_bytes(b"hello"),
            size: 5,
            ref_count: 3,
            members: vec![record("a"), record("b"), record("c")],
        };
        let view = DuplicateGroupView::from(&group);
        assert_eq!(view.wasted_bytes, 10);
        assert_eq!(view.members.len(), 3);
    }
}
