// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Metrics collection and reporting

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

const LATENCY_WINDOW: usize = 10_000;

/// Global metrics collector
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    // Control metrics
    sessions_started: AtomicU64,
    photo_status_calls: AtomicU64,
    authentication_failures: AtomicU64,
    control_failures: AtomicU64,

    // Upload metrics
    uploads_committed: AtomicU64,
    uploads_aborted: AtomicU64,
    uploads_failed: AtomicU64,
    files_stored: AtomicU64,
    bytes_received: AtomicU64,

    // Upload latency tracking (microseconds)
    upload_latencies: RwLock<Vec<u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                sessions_started: AtomicU64::new(0),
                photo_status_calls: AtomicU64::new(0),
                authentication_failures: AtomicU64::new(0),
                control_failures: AtomicU64::new(0),
                uploads_committed: AtomicU64::new(0),
                uploads_aborted: AtomicU64::new(0),
                uploads_failed: AtomicU64::new(0),
                files_stored: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                upload_latencies: RwLock::new(Vec::with_capacity(LATENCY_WINDOW)),
            }),
        }
    }

    // Control metrics
    pub fn record_session(&self) {
        self.inner.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_photo_status(&self) {
        self.inner.photo_status_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authentication_failure(&self) {
        self.inner.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_failure(&self) {
        self.inner.control_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_started(&self) -> u64 {
        self.inner.sessions_started.load(Ordering::Relaxed)
    }

    pub fn photo_status_calls(&self) -> u64 {
        self.inner.photo_status_calls.load(Ordering::Relaxed)
    }

    pub fn authentication_failures(&self) -> u64 {
        self.inner.authentication_failures.load(Ordering::Relaxed)
    }

    pub fn control_failures(&self) -> u64 {
        self.inner.control_failures.load(Ordering::Relaxed)
    }

    // Upload metrics
    /// Record a finished upload request; `committed` is `None` when no sink
    /// handle was obtained.
    pub fn record_upload(&self, committed: Option<bool>, files: u64, bytes: u64, latency_micros: u64) {
        match committed {
            Some(true) => self.inner.uploads_committed.fetch_add(1, Ordering::Relaxed),
            Some(false) => self.inner.uploads_aborted.fetch_add(1, Ordering::Relaxed),
            None => self.inner.uploads_failed.fetch_add(1, Ordering::Relaxed),
        };
        self.inner.files_stored.fetch_add(files, Ordering::Relaxed);
        self.inner.bytes_received.fetch_add(bytes, Ordering::Relaxed);

        let mut latencies = self.inner.upload_latencies.write();
        latencies.push(latency_micros);
        if latencies.len() > LATENCY_WINDOW {
            latencies.drain(0..LATENCY_WINDOW / 2);
        }
    }

    /// Upload that ended at the transport level (bad framing, timeout)
    pub fn record_upload_failure(&self) {
        self.inner.uploads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uploads_committed(&self) -> u64 {
        self.inner.uploads_committed.load(Ordering::Relaxed)
    }

    pub fn uploads_aborted(&self) -> u64 {
        self.inner.uploads_aborted.load(Ordering::Relaxed)
    }

    pub fn uploads_failed(&self) -> u64 {
        self.inner.uploads_failed.load(Ordering::Relaxed)
    }

    pub fn files_stored(&self) -> u64 {
        self.inner.files_stored.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    // Derived metrics
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn latency_percentile(&self, percentile: f64) -> Option<u64> {
        let latencies = self.inner.upload_latencies.read();
        if latencies.is_empty() {
            return None;
        }

        let mut sorted = latencies.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64 * percentile).ceil() as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    pub fn latency_p50(&self) -> Option<u64> {
        self.latency_percentile(0.50)
    }

    pub fn latency_p99(&self) -> Option<u64> {
        self.latency_percentile(0.99)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn prometheus_format(&self) -> String {
        let mut output = String::new();
        let mut counter = |name: &str, help: &str, kind: &str, value: u64| {
            output.push_str(&format!("# HELP eyefi_{} {}\n", name, help));
            output.push_str(&format!("# TYPE eyefi_{} {}\n", name, kind));
            output.push_str(&format!("eyefi_{} {}\n", name, value));
        };

        counter("sessions_started_total", "StartSession calls answered", "counter", self.sessions_started());
        counter("photo_status_total", "GetPhotoStatus calls answered", "counter", self.photo_status_calls());
        counter(
            "authentication_failures_total",
            "Rejected card credentials",
            "counter",
            self.authentication_failures(),
        );
        counter("control_failures_total", "Failed control calls", "counter", self.control_failures());
        counter("uploads_committed_total", "Uploads committed to the sink", "counter", self.uploads_committed());
        counter("uploads_aborted_total", "Uploads aborted after start", "counter", self.uploads_aborted());
        counter("uploads_failed_total", "Uploads that never reached the sink", "counter", self.uploads_failed());
        counter("files_stored_total", "Files handed to the sink", "counter", self.files_stored());
        counter("bytes_received_total", "Archive bytes received", "counter", self.bytes_received());
        counter("uptime_seconds", "Service uptime in seconds", "gauge", self.uptime_seconds());

        if let Some(p50) = self.latency_p50() {
            counter("upload_latency_p50_microseconds", "Upload latency 50th percentile", "gauge", p50);
        }
        if let Some(p99) = self.latency_p99() {
            counter("upload_latency_p99_microseconds", "Upload latency 99th percentile", "gauge", p99);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = Metrics::new();

        metrics.record_session();
        metrics.record_upload(Some(true), 2, 3072, 100);
        metrics.record_upload(Some(false), 0, 512, 200);
        metrics.record_upload(None, 0, 0, 50);
        metrics.record_upload_failure();

        assert_eq!(metrics.sessions_started(), 1);
        assert_eq!(metrics.uploads_committed(), 1);
        assert_eq!(metrics.uploads_aborted(), 1);
        assert_eq!(metrics.uploads_failed(), 2);
        assert_eq!(metrics.files_stored(), 2);
        assert_eq!(metrics.bytes_received(), 3584);
    }

    #[test]
    fn test_latency_percentiles() {
        let metrics = Metrics::new();

        for i in 1..=100 {
            metrics.record_upload(Some(true), 1, 100, i);
        }

        let p50 = metrics.latency_p50().unwrap();
        assert!((45..=55).contains(&p50));

        let p99 = metrics.latency_p99().unwrap();
        assert!((95..=100).contains(&p99));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_authentication_failure();
        let text = metrics.prometheus_format();
        assert!(text.contains("# TYPE eyefi_authentication_failures_total counter"));
        assert!(text.contains("eyefi_authentication_failures_total 1\n"));
        assert!(!text.contains("latency"));
    }
}
