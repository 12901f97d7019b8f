//! Operator-visible counters of a receiver.

use crate::metrics::ReceiverMetrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Point-in-time copy of [`ReceiverStatistics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub received: u64,
    pub retried: u64,
    pub rejected: u64,
    pub quarantined: u64,
    pub processed: u64,
    pub failed: u64,
    pub threads_processing: usize,
    pub processing_time_total_ms: u64,
    pub processing_time_max_ms: u64,
}

impl StatisticsSnapshot {
    pub fn average_processing_ms(&self) -> Option<u64> {
        let runs = self.processed + self.failed;
        (runs > 0).then(|| self.processing_time_total_ms / runs)
    }
}

/// Atomic counters, mirrored to the `metrics` facade
#[derive(Debug)]
pub struct ReceiverStatistics {
    received: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    quarantined: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    threads_processing: AtomicUsize,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
    metrics: ReceiverMetrics,
}

impl ReceiverStatistics {
    pub fn new(metrics: ReceiverMetrics) -> Self {
        Self {
            received: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            threads_processing: AtomicUsize::new(0),
            duration_total_ms: AtomicU64::new(0),
            duration_max_ms: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn metrics(&self) -> &ReceiverMetrics {
        &self.metrics
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.metrics.message_received();
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
        self.metrics.message_retried();
    }

    pub fn record_rejected(&self, reason: &'static str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.metrics.message_rejected(reason);
    }

    pub fn record_quarantined(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
        self.metrics.message_quarantined();
    }

    /// Record the duration of one pipeline run
    pub fn record_processed(&self, duration: Duration, success: bool) {
        let counter = if success { &self.processed } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);

        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.duration_total_ms.fetch_add(millis, Ordering::Relaxed);
        self.duration_max_ms.fetch_max(millis, Ordering::Relaxed);
        self.metrics
            .message_processed(duration, if success { "success" } else { "failed" });
    }

    pub fn processing_started(&self) {
        let now = self.threads_processing.fetch_add(1, Ordering::AcqRel) + 1;
        self.metrics.threads_processing(now);
    }

    pub fn processing_finished(&self) {
        let now = self
            .threads_processing
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        self.metrics.threads_processing(now);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            threads_processing: self.threads_processing.load(Ordering::Relaxed),
            processing_time_total_ms: self.duration_total_ms.load(Ordering::Relaxed),
            processing_time_max_ms: self.duration_max_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ReceiverStatistics::new(ReceiverMetrics::new("orders", "queue"));
        stats.record_received();
        stats.record_received();
        stats.record_retried();
        stats.record_rejected("duplicate");
        stats.record_quarantined();
        stats.record_processed(Duration::from_millis(10), true);
        stats.record_processed(Duration::from_millis(30), false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.rejected, 1);
        assert_eq!(snapshot.quarantined, 1);
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.processing_time_max_ms, 30);
        assert_eq!(snapshot.average_processing_ms(), Some(20));
    }

    #[test]
    fn test_threads_processing_gauge() {
        let stats = ReceiverStatistics::new(ReceiverMetrics::new("orders", "queue"));
        stats.processing_started();
        stats.processing_started();
        stats.processing_finished();
        assert_eq!(stats.snapshot().threads_processing, 1);
        assert_eq!(StatisticsSnapshot::default().average_processing_ms(), None);
    }
}
