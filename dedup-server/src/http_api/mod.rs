//! JSON API over the deduplicating store.

mod handlers;
mod query;
mod responses;

pub use handlers::format_timestamp;

use std::convert::Infallible;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyStream;
use hyper::body::Body;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use tracing::debug;

use dedup_storage::{DedupStore, Result};

use crate::metrics::SharedMetrics;
use query::QueryParams;

pub type HttpBody = UnsyncBoxBody<Bytes, io::Error>;

/// Routes handled by [`ApiService`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Root,
    Health,
    Upload,
    ListFiles,
    FileInfo(String),
    Download(String),
    DownloadBlob(String),
    Delete(String),
    Rename(String),
    Visibility(String),
    Stats,
    Owners,
    Duplicates,
}

impl Route {
    fn resolve(method: &Method, path: &str) -> Option<Self> {
        let route = match (method, path) {
            (&Method::GET, "/") => Route::Root,
            (&Method::GET, "/health") => Route::Health,
            (&Method::POST, "/api/v1/files") => Route::Upload,
            (&Method::GET, "/api/v1/files") => Route::ListFiles,
            (&Method::GET, "/api/v1/stats") => Route::Stats,
            (&Method::GET, "/api/v1/owners") => Route::Owners,
            (&Method::GET, "/api/v1/duplicates") => Route::Duplicates,
            (method, path) if path.starts_with("/api/v1/files/") => {
                let parts: Vec<&str> = path
                    .trim_start_matches("/api/v1/files/")
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .collect();
                match (method, parts.as_slice()) {
                    (&Method::GET, [id]) => Route::FileInfo(id.to_string()),
                    (&Method::DELETE, [id]) => Route::Delete(id.to_string()),
                    (&Method::GET, [id, "content"]) => Route::Download(id.to_string()),
                    (&Method::POST, [id, "rename"]) => Route::Rename(id.to_string()),
                    (&Method::POST, [id, "visibility"]) => Route::Visibility(id.to_string()),
                    _ => return None,
                }
            }
            (&Method::GET, path) if path.starts_with("/api/v1/blobs/") => {
                match path.trim_start_matches("/api/v1/blobs/") {
                    "" => return None,
                    digest if digest.contains('/') => return None,
                    digest => Route::DownloadBlob(digest.to_string()),
                }
            }
            _ => return None,
        };
        Some(route)
    }

    /// Label used in request metrics.
    fn name(&self) -> &'static str {
        match self {
            Route::Root => "root",
            Route::Health => "health",
            Route::Upload => "upload",
            Route::ListFiles => "list_files",
            Route::FileInfo(_) => "file_info",
            Route::Download(_) => "download",
            Route::DownloadBlob(_) => "download_blob",
            Route::Delete(_) => "delete",
            Route::Rename(_) => "rename",
            Route::Visibility(_) => "visibility",
            Route::Stats => "stats",
            Route::Owners => "owners",
            Route::Duplicates => "duplicates",
        }
    }
}

/// HTTP front end of a [`DedupStore`].
#[derive(Clone)]
pub struct ApiService {
    store: Arc<DedupStore>,
    metrics: SharedMetrics,
}

impl ApiService {
    pub fn new(store: Arc<DedupStore>, metrics: SharedMetrics) -> Self {
        Self { store, metrics }
    }

    /// Main request handler
    pub async fn handle_request<B>(
        &self,
        req: Request<B>,
    ) -> std::result::Result<Response<HttpBody>, Infallible>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + 'static,
    {
        let Some(route) = Route::resolve(req.method(), req.uri().path()) else {
            self.metrics.http_request("unknown", 404);
            return Ok(responses::not_found());
        };

        let label = route.name();
        let response = match self.route_request(route, req).await {
            Ok(response) => response,
            Err(err) => responses::storage_error(err),
        };
        debug!(route = label, status = response.status().as_u16(), "request served");
        self.metrics.http_request(label, response.status().as_u16());
        Ok(response)
    }

    async fn route_request<B>(&self, route: Route, req: Request<B>) -> Result<Response<HttpBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: std::fmt::Display + 'static,
    {
        let store = self.store.as_ref();
        let query = QueryParams::parse(req.uri().query());

        match route {
            Route::Root => Ok(self.handle_root()),
            Route::Health => Ok(self.handle_health()),
            Route::Upload => {
                let mime_type = req
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let content_length = req
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let body = handlers::body_stream(BodyStream::new(req.into_body()));
                handlers::upload(store, &query, mime_type.as_deref(), content_length, body).await
            }
            Route::ListFiles => handlers::list_files(store, &query),
            Route::FileInfo(id) => handlers::file_info(store, &id),
            Route::Download(id) => handlers::download(store, &id).await,
            Route::DownloadBlob(digest) => handlers::download_blob(store, &digest).await,
            Route::Delete(id) => handlers::delete(store, &id).await,
            Route::Rename(id) => handlers::rename(store, &id, &query).await,
            Route::Visibility(id) => handlers::set_visibility(store, &id, &query).await,
            Route::Stats => handlers::stats(store, &query),
            Route::Owners => handlers::owners(store),
            Route::Duplicates => handlers::duplicates(store, &query),
        }
    }

    fn handle_root(&self) -> Response<HttpBody> {
        let info = serde_json::json!({
            "name": "dedup-server HTTP API",
            "version": env!("CARGO_PKG_VERSION"),
            "endpoints": {
                "POST /api/v1/files?owner=&name=": "Upload a file (raw body)",
                "GET /api/v1/files": "List files with filters, sorting and paging",
                "GET /api/v1/files/{id}": "File metadata",
                "GET /api/v1/files/{id}/content": "Download a file",
                "DELETE /api/v1/files/{id}": "Delete a file",
                "POST /api/v1/files/{id}/rename?name=": "Rename a file",
                "POST /api/v1/files/{id}/visibility?public=": "Share or unshare a file",
                "GET /api/v1/blobs/{hash}": "Download content by hash",
                "GET /api/v1/stats[?owner=]": "Storage savings",
                "GET /api/v1/owners": "Per-owner report",
                "GET /api/v1/duplicates[?owner=]": "Duplicate groups",
                "GET /health": "Health check"
            }
        });
        responses::json_response(StatusCode::OK, &info)
    }

    fn handle_health(&self) -> Response<HttpBody> {
        let health = serde_json::json!({
            "status": "healthy",
            "storage": "operational"
        });
        responses::json_response(StatusCode::OK, &health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_resolution() {
        let id = "0190f0f4-7d1c-7cc0-8000-000000000000";
        assert_eq!(
            Route::resolve(&Method::POST, "/api/v1/files"),
            Some(Route::Upload)
        );
        assert_eq!(
            Route::resolve(&Method::GET, &format!("/api/v1/files/{id}")),
            Some(Route::FileInfo(id.to_string()))
        );
        assert_eq!(
            Route::resolve(&Method::GET, &format!("/api/v1/files/{id}/content")),
            Some(Route::Download(id.to_string()))
        );
        assert_eq!(
            Route::resolve(&Method::DELETE, &format!("/api/v1/files/{id}")),
            Some(Route::Delete(id.to_string()))
        );
        assert_eq!(
            Route::resolve(&Method::POST, &format!("/api/v1/files/{id}/visibility")),
            Some(Route::Visibility(id.to_string()))
        );
        assert_eq!(
            Route::resolve(&Method::GET, "/api/v1/blobs/abcd"),
            Some(Route::DownloadBlob("abcd".to_string()))
        );
        assert_eq!(Route::resolve(&Method::PUT, "/api/v1/files"), None);
        assert_eq!(Route::resolve(&Method::GET, "/api/v1/blobs/"), None);
        assert_eq!(
            Route::resolve(&Method::GET, &format!("/api/v1/files/{id}/bogus")),
            None
        );
    }
}
