use std::sync::Arc;

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

use dedup_storage::{MetricsCollector, SharedMetrics as StorageMetrics};

lazy_static! {
    static ref BLOBS_PENDING: IntCounter = register_int_counter!(
        "dedup_blobs_pending_total",
        "Uploads that started staging a blob"
    )
    .unwrap();
    static ref BLOBS_WRITTEN: IntCounter = register_int_counter!(
        "dedup_blobs_written_total",
        "Blobs physically written"
    )
    .unwrap();
    static ref BLOB_WRITE_ERRORS: IntCounter = register_int_counter!(
        "dedup_blob_write_errors_total",
        "Failed blob writes"
    )
    .unwrap();
    static ref DUPLICATE_HITS: IntCounter = register_int_counter!(
        "dedup_duplicate_hits_total",
        "Uploads whose content was already stored"
    )
    .unwrap();
    static ref BLOBS_DROPPED: IntCounter = register_int_counter!(
        "dedup_blobs_dropped_total",
        "Blobs deleted after their last reference went away"
    )
    .unwrap();
    static ref BYTES_SENT: IntCounter =
        register_int_counter!("dedup_bytes_sent_total", "Payload bytes served").unwrap();
    static ref BYTES_RECEIVED: IntCounter =
        register_int_counter!("dedup_bytes_received_total", "Payload bytes received").unwrap();
    static ref INVARIANT_VIOLATIONS: IntCounter = register_int_counter!(
        "dedup_invariant_violations_total",
        "Reference count invariant violations"
    )
    .unwrap();
    static ref HTTP_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "dedup_http_requests_total",
        "API requests by route and status",
        &["route", "status"]
    )
    .unwrap();
    static ref UNIQUE_BLOBS: IntGauge =
        register_int_gauge!("dedup_unique_blobs", "Distinct payloads referenced").unwrap();
}

/// Prometheus-backed metrics, registered in the default registry.
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics;

impl SharedMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Adapter handed to the storage layer.
    pub fn to_storage_metrics(&self) -> StorageMetrics {
        StorageMetrics::new(Arc::new(self.clone()))
    }

    pub fn http_request(&self, route: &str, status: u16) {
        HTTP_REQUESTS
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    pub fn set_unique_blobs(&self, count: usize) {
        UNIQUE_BLOBS.set(count as i64);
    }
}

impl MetricsCollector for SharedMetrics {
    fn blob_pending(&self) {
        BLOBS_PENDING.inc();
    }

    fn blob_written(&self) {
        BLOBS_WRITTEN.inc();
    }

    fn blob_write_error(&self) {
        BLOB_WRITE_ERRORS.inc();
    }

    fn duplicate_hit(&self) {
        DUPLICATE_HITS.inc();
    }

    fn blobs_dropped(&self, amount: u64) {
        BLOBS_DROPPED.inc_by(amount);
    }

    fn bytes_sent(&self, amount: usize) {
        BYTES_SENT.inc_by(amount as u64);
    }

    fn bytes_received(&self, amount: usize) {
        BYTES_RECEIVED.inc_by(amount as u64);
    }

    fn invariant_violation(&self) {
        INVARIANT_VIOLATIONS.inc();
    }
}

/// Renders the default registry in the Prometheus text format.
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    use prometheus::Encoder;

    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}
