//! Job ingestion gate
//!
//! Drops re-deliveries of a (source, job_id) identity and tracks the
//! event-time watermark. Jobs may arrive out of order; only the watermark
//! is monotonic.

use std::collections::{HashSet, VecDeque};

use monitor_types::ids::SourceId;
use monitor_types::job::Job;
use tracing::{debug, info, warn};

/// Result of offering a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionResult {
    /// New identity; forward to the matcher.
    Accepted,
    /// Identity already seen within the dedup window.
    Dropped,
    /// `observed_at` outside the accepted range; never deduped or matched.
    Rejected,
}

/// Configuration for the job ingester.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Maximum number of recent identities remembered for dedup.
    pub dedup_window: usize,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            dedup_window: 100_000,
        }
    }
}

/// Deduplicating ingestion gate with an event-time watermark.
pub struct JobIngester {
    seen: HashSet<(SourceId, String)>,
    /// Insertion order of `seen`, oldest first.
    order: VecDeque<(SourceId, String)>,
    watermark: Option<i64>,
    config: IngesterConfig,
    jobs_accepted: u64,
    jobs_dropped: u64,
    jobs_rejected: u64,
    /// Accepted jobs observed before the current watermark.
    late_arrivals: u64,
}

impl JobIngester {
    pub fn new(config: IngesterConfig) -> Self {
        info!(dedup_window = config.dedup_window, "JobIngester initialized");

        Self {
            seen: HashSet::with_capacity(config.dedup_window),
            order: VecDeque::with_capacity(config.dedup_window),
            watermark: None,
            config,
            jobs_accepted: 0,
            jobs_dropped: 0,
            jobs_rejected: 0,
            late_arrivals: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(IngesterConfig::default())
    }

    /// Offer a job. Advances the watermark when the job is accepted.
    pub fn ingest(&mut self, job: &Job) -> IngestionResult {
        if !job.has_valid_observed_at() {
            self.jobs_rejected += 1;
            warn!(
                source = %job.source,
                job_id = %job.job_id,
                observed_at = job.observed_at,
                "Rejecting job with out-of-range timestamp"
            );
            return IngestionResult::Rejected;
        }

        let identity = job.identity();

        if self.seen.contains(&identity) {
            self.jobs_dropped += 1;
            debug!(
                source = %job.source,
                job_id = %job.job_id,
                "Dropping duplicate job"
            );
            return IngestionResult::Dropped;
        }

        self.record(identity);
        self.jobs_accepted += 1;

        match self.watermark {
            Some(w) if job.observed_at < w => {
                self.late_arrivals += 1;
                debug!(
                    source = %job.source,
                    job_id = %job.job_id,
                    observed_at = job.observed_at,
                    watermark = w,
                    "Out-of-order job accepted"
                );
            }
            _ => self.watermark = Some(job.observed_at),
        }

        IngestionResult::Accepted
    }

    /// Highest `observed_at` accepted so far.
    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn jobs_accepted(&self) -> u64 {
        self.jobs_accepted
    }

    pub fn jobs_dropped(&self) -> u64 {
        self.jobs_dropped
    }

    pub fn jobs_rejected(&self) -> u64 {
        self.jobs_rejected
    }

    pub fn late_arrivals(&self) -> u64 {
        self.late_arrivals
    }

    fn record(&mut self, identity: (SourceId, String)) {
        if self.order.len() >= self.config.dedup_window {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(identity.clone());
        self.order.push_back(identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn make_job(source: &str, job_id: &str, observed_at: i64) -> Job {
        Job {
            source: SourceId::new(source),
            job_id: job_id.to_string(),
            observed_at,
            height: 800_000,
            prev_block_hash: "00aa".to_string(),
            version: "20000000".to_string(),
            bits: "17034219".to_string(),
            time: 0,
            difficulty: Decimal::ZERO,
            clean_jobs: false,
            mining_pool: "pool".to_string(),
            coinbase_tx: "cb".to_string(),
            merkle_branches: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let mut ingester = JobIngester::with_defaults();

        assert_eq!(ingester.ingest(&make_job("a", "j1", 0)), IngestionResult::Accepted);
        assert_eq!(ingester.ingest(&make_job("a", "j1", 50)), IngestionResult::Dropped);
        assert_eq!(ingester.jobs_dropped(), 1);
        assert_eq!(ingester.jobs_accepted(), 1);
    }

    #[test]
    fn test_same_job_id_different_source_accepted() {
        let mut ingester = JobIngester::with_defaults();

        assert_eq!(ingester.ingest(&make_job("a", "j1", 0)), IngestionResult::Accepted);
        assert_eq!(ingester.ingest(&make_job("b", "j1", 0)), IngestionResult::Accepted);
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let mut ingester = JobIngester::with_defaults();

        ingester.ingest(&make_job("a", "j1", 1_000));
        ingester.ingest(&make_job("a", "j2", 400));
        assert_eq!(ingester.watermark(), Some(1_000));
        assert_eq!(ingester.late_arrivals(), 1);

        ingester.ingest(&make_job("a", "j3", 2_000));
        assert_eq!(ingester.watermark(), Some(2_000));
    }

    #[test]
    fn test_dedup_window_eviction() {
        let mut ingester = JobIngester::new(IngesterConfig { dedup_window: 2 });

        ingester.ingest(&make_job("a", "j1", 0));
        ingester.ingest(&make_job("a", "j2", 1));
        ingester.ingest(&make_job("a", "j3", 2));

        // j1 fell out of the window
        assert_eq!(ingester.ingest(&make_job("a", "j1", 3)), IngestionResult::Accepted);
        assert_eq!(ingester.ingest(&make_job("a", "j3", 4)), IngestionResult::Dropped);
    }

    #[test]
    fn test_out_of_range_timestamp_rejected() {
        let mut ingester = JobIngester::with_defaults();

        ingester.ingest(&make_job("a", "j1", 1_000));
        assert_eq!(ingester.ingest(&make_job("b", "j2", i64::MIN + 10)), IngestionResult::Rejected);
        assert_eq!(ingester.ingest(&make_job("b", "j3", i64::MAX)), IngestionResult::Rejected);
        assert_eq!(ingester.jobs_rejected(), 2);
        assert_eq!(ingester.watermark(), Some(1_000));

        // a rejected identity is not remembered
        assert_eq!(ingester.ingest(&make_job("b", "j2", 1_200)), IngestionResult::Accepted);
    }
}
