use std::{
    fmt,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
    time::Duration,
};

/// Run counters shared between the poller, the router, and whoever reports on the run.
#[derive(Default)]
pub struct BackfillMetrics {
    fetch_attempts: AtomicU64,
    fetch_success: AtomicU64,
    fetch_failures: AtomicU64,
    pages: AtomicU64,
    candles_received: AtomicU64,
    rows_written: AtomicU64,
    partitions_opened: AtomicU64,
    partitions_closed: AtomicU64,
    cursor_ms: AtomicI64,
    fetch_latency_total_ns: AtomicU64,
    fetch_latency_samples: AtomicU64,
    fetch_latency_max_ns: AtomicU64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillMetricsSnapshot {
    pub fetch_attempts: u64,
    pub fetch_success: u64,
    pub fetch_failures: u64,
    pub pages: u64,
    pub candles_received: u64,
    pub rows_written: u64,
    pub partitions_opened: u64,
    pub partitions_closed: u64,
    pub cursor_ms: i64,
    pub fetch_latency_ms_avg: f64,
    pub fetch_latency_ms_max: f64,
}

impl BackfillMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fetch_attempt(&self) {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_success(&self, elapsed: Duration) {
        self.fetch_success.fetch_add(1, Ordering::Relaxed);
        self.observe_latency(elapsed);
    }

    pub fn record_fetch_failure(&self, elapsed: Duration) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        self.observe_latency(elapsed);
    }

    pub fn record_page(&self, candles: usize, cursor_ms: i64) {
        self.pages.fetch_add(1, Ordering::Relaxed);
        self.candles_received
            .fetch_add(candles as u64, Ordering::Relaxed);
        self.cursor_ms.store(cursor_ms, Ordering::Relaxed);
    }

    pub fn record_cursor(&self, cursor_ms: i64) {
        self.cursor_ms.store(cursor_ms, Ordering::Relaxed);
    }

    pub fn record_row_written(&self) {
        self.rows_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partition_opened(&self) {
        self.partitions_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partition_closed(&self) {
        self.partitions_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BackfillMetricsSnapshot {
        let total_ns = self.fetch_latency_total_ns.load(Ordering::Relaxed);
        let samples = self.fetch_latency_samples.load(Ordering::Relaxed);
        let max_ns = self.fetch_latency_max_ns.load(Ordering::Relaxed);
        let avg_ms = if samples > 0 {
            (total_ns as f64 / samples as f64) / 1_000_000.0
        } else {
            0.0
        };
        BackfillMetricsSnapshot {
            fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            fetch_success: self.fetch_success.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            candles_received: self.candles_received.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            partitions_opened: self.partitions_opened.load(Ordering::Relaxed),
            partitions_closed: self.partitions_closed.load(Ordering::Relaxed),
            cursor_ms: self.cursor_ms.load(Ordering::Relaxed),
            fetch_latency_ms_avg: avg_ms,
            fetch_latency_ms_max: max_ns as f64 / 1_000_000.0,
        }
    }

    fn observe_latency(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.fetch_latency_total_ns
            .fetch_add(nanos, Ordering::Relaxed);
        self.fetch_latency_samples.fetch_add(1, Ordering::Relaxed);
        let mut current = self.fetch_latency_max_ns.load(Ordering::Relaxed);
        while nanos > current {
            match self.fetch_latency_max_ns.compare_exchange(
                current,
                nanos,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl fmt::Display for BackfillMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetches={} ok={} failed={} pages={} candles={} rows={} partitions={}/{} cursor={} latency_avg={:.1}ms latency_max={:.1}ms",
            self.fetch_attempts,
            self.fetch_success,
            self.fetch_failures,
            self.pages,
            self.candles_received,
            self.rows_written,
            self.partitions_closed,
            self.partitions_opened,
            self.cursor_ms,
            self.fetch_latency_ms_avg,
            self.fetch_latency_ms_max
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_latency_and_counters() {
        let metrics = BackfillMetrics::new();
        metrics.record_fetch_attempt();
        metrics.record_fetch_failure(Duration::from_millis(30));
        metrics.record_fetch_attempt();
        metrics.record_fetch_success(Duration::from_millis(10));
        metrics.record_page(1_000, 1_513_555_260_001);
        metrics.record_row_written();
        metrics.record_partition_opened();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.fetch_attempts, 2);
        assert_eq!(snapshot.fetch_success, 1);
        assert_eq!(snapshot.fetch_failures, 1);
        assert_eq!(snapshot.pages, 1);
        assert_eq!(snapshot.candles_received, 1_000);
        assert_eq!(snapshot.rows_written, 1);
        assert_eq!(snapshot.partitions_opened, 1);
        assert_eq!(snapshot.partitions_closed, 0);
        assert_eq!(snapshot.cursor_ms, 1_513_555_260_001);
        assert!((snapshot.fetch_latency_ms_avg - 20.0).abs() < 1e-9);
        assert!((snapshot.fetch_latency_ms_max - 30.0).abs() < 1e-9);
    }
}
