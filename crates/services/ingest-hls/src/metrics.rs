//! Metrics collection for the live ingest gateway
//!
//! Provides basic metrics for monitoring gateway health and performance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Gateway metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Total sessions started since startup
    sessions_started: AtomicU64,

    /// Total sessions torn down since startup
    sessions_stopped: AtomicU64,

    /// Sessions replaced by a new start under the same key
    sessions_replaced: AtomicU64,

    /// Total ingest chunks received
    chunks_received: AtomicU64,

    /// Total ingest bytes received
    bytes_received: AtomicU64,

    /// Encoder processes spawned (including restarts)
    encoder_spawns: AtomicU64,

    /// Encoder restarts after a failure
    encoder_restarts: AtomicU64,

    /// Encoder runs that ended in failure
    encoder_failures: AtomicU64,

    /// Timelapse jobs started
    timelapse_started: AtomicU64,

    /// Timelapse jobs completed
    timelapse_completed: AtomicU64,

    /// Timelapse jobs failed
    timelapse_failed: AtomicU64,

    /// Timelapse requests served from cache
    timelapse_cache_hits: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            startup_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_replaced(&self) {
        self.sessions_replaced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one ingest chunk of `bytes` length
    pub fn chunk_received(&self, bytes: u64) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn encoder_spawned(&self) {
        self.encoder_spawns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encoder_restarted(&self) {
        self.encoder_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encoder_failed(&self) {
        self.encoder_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timelapse_started(&self) {
        self.timelapse_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timelapse_completed(&self) {
        self.timelapse_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timelapse_failed(&self) {
        self.timelapse_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn timelapse_cache_hit(&self) {
        self.timelapse_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let uptime_secs = now.saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            sessions_replaced: self.sessions_replaced.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            encoder_spawns: self.encoder_spawns.load(Ordering::Relaxed),
            encoder_restarts: self.encoder_restarts.load(Ordering::Relaxed),
            encoder_failures: self.encoder_failures.load(Ordering::Relaxed),
            timelapse_started: self.timelapse_started.load(Ordering::Relaxed),
            timelapse_completed: self.timelapse_completed.load(Ordering::Relaxed),
            timelapse_failed: self.timelapse_failed.load(Ordering::Relaxed),
            timelapse_cache_hits: self.timelapse_cache_hits.load(Ordering::Relaxed),
            uptime_secs,
        }
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_stopped: u64,
    pub sessions_replaced: u64,
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub encoder_spawns: u64,
    pub encoder_restarts: u64,
    pub encoder_failures: u64,
    pub timelapse_started: u64,
    pub timelapse_completed: u64,
    pub timelapse_failed: u64,
    pub timelapse_cache_hits: u64,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Calculate ingest bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.bytes_received as f64 / self.uptime_secs as f64
        }
    }
}

/// Global metrics instance
static GLOBAL_METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance
pub fn global_metrics() -> Arc<Metrics> {
    GLOBAL_METRICS
        .get_or_init(|| Arc::new(Metrics::new()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.sessions_started, 0);
        assert_eq!(snapshot.encoder_spawns, 0);
        assert_eq!(snapshot.bytes_received, 0);
    }

    #[test]
    fn test_chunk_tracking() {
        let metrics = Metrics::new();

        metrics.chunk_received(100);
        metrics.chunk_received(200);
        metrics.chunk_received(150);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.chunks_received, 3);
        assert_eq!(snapshot.bytes_received, 450);
    }

    #[test]
    fn test_encoder_tracking() {
        let metrics = Metrics::new();

        metrics.encoder_spawned();
        metrics.encoder_failed();
        metrics.encoder_restarted();
        metrics.encoder_spawned();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.encoder_spawns, 2);
        assert_eq!(snapshot.encoder_failures, 1);
        assert_eq!(snapshot.encoder_restarts, 1);
    }

    #[test]
    fn test_global_metrics() {
        let m1 = global_metrics();
        let m2 = global_metrics();

        // Should be the same instance
        m1.session_started();
        assert_eq!(m2.snapshot().sessions_started, m1.snapshot().sessions_started);
    }
}
