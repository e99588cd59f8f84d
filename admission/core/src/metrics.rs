//! Latency Metrics
//!
//! Lock-free histogram backing the scheduler's wait-time and processing-time
//! statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

// ============================================================================
// Histogram
// ============================================================================

/// Bucketed latency histogram (milliseconds)
#[derive(Debug)]
pub struct Histogram {
    /// Upper bucket bounds in milliseconds
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    /// Sum of recorded values in microseconds
    sum_micros: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket bounds
    #[must_use]
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    /// Buckets suited to queue wait and execution times
    #[must_use]
    pub fn latency_default() -> Self {
        Self::new(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
            30000.0, 60000.0, 120_000.0,
        ])
    }

    /// Record one observation
    pub fn record(&self, value: Duration) {
        let millis = value.as_secs_f64() * 1000.0;
        let micros = u64::try_from(value.as_micros()).unwrap_or(u64::MAX);

        let idx = self
            .buckets
            .iter()
            .position(|&bound| millis <= bound)
            .unwrap_or(self.buckets.len().saturating_sub(1));
        if let Some(count) = self.counts.get(idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }

        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Number of observations
    #[must_use]
    pub fn count(&self) -> u64 {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Mean of all observations
    #[must_use]
    pub fn mean(&self) -> Duration {
        let total = self.count();
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.sum_micros.load(Ordering::Relaxed) / total)
    }

    /// Current bucket counts
    #[must_use]
    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total: self.count(),
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Upper bucket bounds (ms)
    pub buckets: Vec<f64>,
    /// Observations per bucket
    pub counts: Vec<u64>,
    /// Total observations
    pub total: u64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }

        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (bound, &count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count;
            if cumulative >= target {
                return *bound;
            }
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }

    /// Median bucket bound
    #[must_use]
    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    /// 99th percentile bucket bound
    #[must_use]
    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_and_mean() {
        let hist = Histogram::new(vec![10.0, 100.0, 1000.0]);
        hist.record(Duration::from_millis(5));
        hist.record(Duration::from_millis(50));
        hist.record(Duration::from_millis(50));
        hist.record(Duration::from_millis(5000));

        let snap = hist.snapshot();
        assert_eq!(snap.counts, vec![1, 2, 1]);
        assert_eq!(snap.total, 4);
        assert_eq!(hist.mean(), Duration::from_micros(1_276_250));
        assert_eq!(snap.p50(), 100.0);
        assert_eq!(snap.p99(), 1000.0);
    }

    #[test]
    fn test_empty_histogram() {
        let hist = Histogram::latency_default();
        assert_eq!(hist.count(), 0);
        assert_eq!(hist.mean(), Duration::ZERO);
        assert_eq!(hist.snapshot().p50(), 0.0);
    }

    #[test]
    fn test_overflow_lands_in_last_bucket() {
        let hist = Histogram::new(vec![1.0, 2.0]);
        hist.record(Duration::from_secs(90));

        let snap = hist.snapshot();
        assert_eq!(snap.counts, vec![0, 1]);
        assert_eq!(snap.p99(), 2.0);
    }
}
