use std::sync::Arc;

/// Shared metrics collector interface
///
/// This is a trait object that allows applications to plug in their own
/// metrics implementations (Prometheus, StatsD, etc.)
pub trait MetricsCollector: Send + Sync {
    fn blob_pending(&self);
    fn blob_written(&self);
    fn blob_write_error(&self);
    fn duplicate_hit(&self);
    fn blobs_dropped(&self, amount: u64);
    fn bytes_sent(&self, amount: usize);
    fn bytes_received(&self, amount: usize);
    fn invariant_violation(&self);
}

/// No-op metrics collector (default)
#[derive(Debug, Clone, Default)]
pub struct NoOpMetrics;

impl MetricsCollector for NoOpMetrics {
    fn blob_pending(&self) {}
    fn blob_written(&self) {}
    fn blob_write_error(&self) {}
    fn duplicate_hit(&self) {}
    fn blobs_dropped(&self, _amount: u64) {}
    fn bytes_sent(&self, _amount: usize) {}
    fn bytes_received(&self, _amount: usize) {}
    fn invariant_violation(&self) {}
}

/// Shared reference to metrics collector
#[derive(Clone)]
pub struct SharedMetrics(Arc<dyn MetricsCollector>);

impl SharedMetrics {
    pub fn new(collector: Arc<dyn MetricsCollector>) -> Self {
        Self(collector)
    }

    pub fn blob_pending(&self) {
        self.0.blob_pending();
    }

    pub fn blob_written(&self) {
        self.0.blob_written();
    }

    pub fn blob_write_error(&self) {
        self.0.blob_write_error();
    }

    pub fn duplicate_hit(&self) {
        self.0.duplicate_hit();
    }

    pub fn blobs_dropped(&self, amount: u64) {
        self.0.blobs_dropped(amount);
    }

    pub fn bytes_sent(&self, amount: usize) {
        self.0.bytes_sent(amount);
    }

    pub fn bytes_received(&self, amount: usize) {
        self.0.bytes_received(amount);
    }

    pub fn invariant_violation(&self) {
        self.0.invariant_violation();
    }
}

impl Default for SharedMetrics {
    fn default() -> Self {
        Self(Arc::new(NoOpMetrics))
    }
}

impl std::fmt::Debug for SharedMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedMetrics")
    }
}
