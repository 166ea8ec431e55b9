use std::io;

use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use dedup_storage::{BlobReader, DedupError};

use super::HttpBody;

pub fn full_body(bytes: impl Into<Bytes>) -> HttpBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<HttpBody> {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    let mut resp = Response::new(full_body(json));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

pub fn error_response(status: StatusCode, message: &str) -> Response<HttpBody> {
    let error = serde_json::json!({
        "error": message,
        "status": status.as_u16()
    });
    json_response(status, &error)
}

pub fn not_found() -> Response<HttpBody> {
    error_response(StatusCode::NOT_FOUND, "Not Found")
}

/// Status code for a storage error.
pub fn status_for(err: &DedupError) -> StatusCode {
    match err {
        DedupError::NotFound(_) | DedupError::Conflict(_) => StatusCode::NOT_FOUND,
        DedupError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        DedupError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        DedupError::InvariantViolation(_) | DedupError::StorageIo(_) | DedupError::Meta(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub fn storage_error(err: DedupError) -> Response<HttpBody> {
    let err = err.conflict_as_not_found();
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    error_response(status, &err.to_string())
}

/// Streams a blob as the response body.
pub fn content_response(
    reader: BlobReader,
    mime_type: &str,
    file_name: Option<&str>,
) -> Response<HttpBody> {
    let len = reader.len();
    let digest = reader.digest();
    let body = StreamBody::new(reader.map_ok(Frame::data));
    let mut resp = Response::new(BodyExt::boxed_unsync(body));

    let headers = resp.headers_mut();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Ok(value) = HeaderValue::from_str(&digest.to_hex()) {
        headers.insert(HeaderName::from_static("x-content-digest"), value);
    }
    if let Some(value) = file_name.and_then(content_disposition) {
        headers.insert(hyper::header::CONTENT_DISPOSITION, value);
    }
    resp
}

fn content_disposition(name: &str) -> Option<HeaderValue> {
    let escaped = urlencoding::encode(name);
    HeaderValue::from_str(&format!("attachment; filename*=UTF-8''{escaped}")).ok()
}

pub(crate) fn io_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::other(err.to_string())
}
