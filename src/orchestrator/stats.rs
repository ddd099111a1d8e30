//! Orchestrator counters and derived metrics

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counters plus derived metrics. Process-local; no cross-process
/// aggregation.
pub struct Stats {
    messages_saved: AtomicU64,
    requests_sent: AtomicU64,
    translations_received: AtomicU64,
    errors: AtomicU64,
    pool_full_rejections: AtomicU64,
    /// Sum of worker processing times, for the running mean.
    processing_time_total_ms: AtomicU64,
    started_at: Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            messages_saved: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            translations_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            pool_full_rejections: AtomicU64::new(0),
            processing_time_total_ms: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc_messages_saved(&self) {
        self.messages_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed translation and its worker processing time.
    pub fn record_translation(&self, processing_time_ms: u64) {
        self.translations_received.fetch_add(1, Ordering::Relaxed);
        self.processing_time_total_ms
            .fetch_add(processing_time_ms, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Workers reported the translation pool saturated.
    pub fn inc_pool_full_rejections(&self) {
        self.pool_full_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn messages_saved(&self) -> u64 {
        self.messages_saved.load(Ordering::Relaxed)
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub fn translations_received(&self) -> u64 {
        self.translations_received.load(Ordering::Relaxed)
    }

    pub fn pool_full_rejections(&self) -> u64 {
        self.pool_full_rejections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let received = self.translations_received.load(Ordering::Relaxed);
        let total_ms = self.processing_time_total_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            messages_saved: self.messages_saved.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            translations_received: received,
            errors: self.errors.load(Ordering::Relaxed),
            pool_full_rejections: self.pool_full_rejections.load(Ordering::Relaxed),
            avg_processing_time_ms: if received > 0 {
                total_ms as f64 / received as f64
            } else {
                0.0
            },
            uptime_seconds: self.started_at.elapsed().as_secs(),
            memory_usage_mb: resident_memory_mb(),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub messages_saved: u64,
    pub requests_sent: u64,
    pub translations_received: u64,
    pub errors: u64,
    pub pool_full_rejections: u64,
    pub avg_processing_time_ms: f64,
    pub uptime_seconds: u64,
    pub memory_usage_mb: f64,
}

/// Resident set size in megabytes. Linux only; 0.0 elsewhere.
fn resident_memory_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
            {
                return (resident_pages * 4096) as f64 / (1024.0 * 1024.0);
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Stats::new();
        stats.inc_messages_saved();
        stats.inc_requests_sent();
        stats.inc_requests_sent();
        stats.inc_errors();
        stats.inc_pool_full_rejections();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.messages_saved, 1);
        assert_eq!(snapshot.requests_sent, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.pool_full_rejections, 1);
    }

    #[test]
    fn test_avg_processing_time_running_mean() {
        let stats = Stats::new();
        assert_eq!(stats.snapshot().avg_processing_time_ms, 0.0);

        stats.record_translation(100);
        stats.record_translation(300);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.translations_received, 2);
        assert!((snapshot.avg_processing_time_ms - 200.0).abs() < f64::EPSILON);
    }
}
