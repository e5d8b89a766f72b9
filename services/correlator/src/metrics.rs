//! Pipeline metrics
//!
//! Counters for every stage plus a bounded latency window for per-job
//! processing time. Exported as a flat map for scraping or logging.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters shared by every pipeline stage.
pub struct PipelineMetrics {
    // Ingestion
    pub events_received: AtomicU64,
    pub events_rejected: AtomicU64,
    pub jobs_accepted: AtomicU64,
    pub jobs_duplicate: AtomicU64,

    // Matching
    pub matches_created: AtomicU64,
    pub matches_extended: AtomicU64,
    pub matches_frozen: AtomicU64,

    // Propagation
    pub samples_recorded: AtomicU64,
    pub invariant_violations: AtomicU64,

    pub job_processing_ns: Mutex<LatencyTracker>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            jobs_accepted: AtomicU64::new(0),
            jobs_duplicate: AtomicU64::new(0),
            matches_created: AtomicU64::new(0),
            matches_extended: AtomicU64::new(0),
            matches_frozen: AtomicU64::new(0),
            samples_recorded: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            job_processing_ns: Mutex::new(LatencyTracker::new(1000)),
        }
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Raw event rejected by the normalizer.
    pub fn record_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.jobs_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.jobs_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match_created(&self) {
        self.matches_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_match_extended(&self) {
        self.matches_extended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frozen(&self, samples: u64) {
        self.matches_frozen.fetch_add(1, Ordering::Relaxed);
        self.samples_recorded.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_violation(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processing(&self, latency_ns: u64) {
        if let Ok(mut tracker) = self.job_processing_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn export(&self) -> BTreeMap<String, u64> {
        let mut m = BTreeMap::new();
        m.insert("events_received".to_string(), self.events_received.load(Ordering::Relaxed));
        m.insert("events_rejected".to_string(), self.events_rejected.load(Ordering::Relaxed));
        m.insert("jobs_accepted".to_string(), self.jobs_accepted.load(Ordering::Relaxed));
        m.insert("jobs_duplicate".to_string(), self.jobs_duplicate.load(Ordering::Relaxed));
        m.insert("matches_created".to_string(), self.matches_created.load(Ordering::Relaxed));
        m.insert("matches_extended".to_string(), self.matches_extended.load(Ordering::Relaxed));
        m.insert("matches_frozen".to_string(), self.matches_frozen.load(Ordering::Relaxed));
        m.insert("samples_recorded".to_string(), self.samples_recorded.load(Ordering::Relaxed));
        m.insert("invariant_violations".to_string(), self.invariant_violations.load(Ordering::Relaxed));
        if let Ok(tracker) = self.job_processing_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                m.insert("job_processing_p99_ns".to_string(), p99);
            }
            if let Some(avg) = tracker.average() {
                m.insert("job_processing_avg_ns".to_string(), avg);
            }
        }
        m
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding window of latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();

        metrics.record_received();
        metrics.record_received();
        metrics.record_rejected();
        metrics.record_accepted();
        metrics.record_duplicate();
        metrics.record_frozen(3);

        let exported = metrics.export();
        assert_eq!(exported["events_received"], 2);
        assert_eq!(exported["events_rejected"], 1);
        assert_eq!(exported["jobs_accepted"], 1);
        assert_eq!(exported["jobs_duplicate"], 1);
        assert_eq!(exported["matches_frozen"], 1);
        assert_eq!(exported["samples_recorded"], 3);
        assert!(!exported.contains_key("job_processing_p99_ns"));
    }

    #[test]
    fn test_latency_tracker_percentile() {
        let mut tracker = LatencyTracker::new(100);

        for i in 1..=100 {
            tracker.record(i);
        }

        let p50 = tracker.percentile(50).unwrap();
        assert!((49..=51).contains(&p50));

        let p99 = tracker.percentile(99).unwrap();
        assert!((98..=100).contains(&p99));
    }

    #[test]
    fn test_latency_tracker_window_eviction() {
        let mut tracker = LatencyTracker::new(3);

        tracker.record(10);
        tracker.record(20);
        tracker.record(30);
        tracker.record(40);

        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.average().unwrap(), 30);
    }

    #[test]
    fn test_processing_latency_exported() {
        let metrics = PipelineMetrics::new();
        metrics.record_processing(100);
        metrics.record_processing(300);

        let exported = metrics.export();
        assert_eq!(exported["job_processing_avg_ns"], 200);
    }
}
