//! Correlation engine
//!
//! [`MonitorState`] bundles every read model the pipeline produces and the
//! fold operations that update them. [`CorrelationEngine`] drives that state
//! synchronously from a single thread: normalize, dedup, match, expire,
//! analyze. The async pipeline runs the same folds from its shard tasks.

use std::sync::Arc;
use std::time::Instant;

use monitor_types::correlation::Match;
use monitor_types::errors::{ConfigurationError, MonitorError, SchemaMappingError};
use monitor_types::job::Job;
use serde_json::Value;
use tracing::{info, warn};

use crate::aggregates::AggregateStore;
use crate::config::MonitorConfig;
use crate::ingestion::{IngesterConfig, IngestionResult, JobIngester};
use crate::matcher::{InsertOutcome, Matcher};
use crate::metrics::PipelineMetrics;
use crate::normalizer::{Normalizer, RawEvent};
use crate::propagation::PropagationAnalyzer;
use crate::query::MonitorQuery;
use crate::store::{JobLog, MatchRegistry};

/// Shared read models and the folds that update them.
pub struct MonitorState {
    pub config: MonitorConfig,
    pub jobs: JobLog,
    pub matches: MatchRegistry,
    pub analyzer: PropagationAnalyzer,
    pub aggregates: AggregateStore,
    pub metrics: PipelineMetrics,
}

impl MonitorState {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            jobs: JobLog::new(config.pipeline.max_retained_jobs),
            matches: MatchRegistry::new(config.pipeline.max_retained_matches),
            analyzer: PropagationAnalyzer::new(config.propagation.clone()),
            aggregates: AggregateStore::new(config.aggregates.clone()),
            metrics: PipelineMetrics::new(),
            config,
        }
    }

    /// A job passed dedup.
    pub fn on_accepted(&self, job: &Job) {
        self.metrics.record_accepted();
        self.aggregates.record_job(job);
        self.jobs.push(job.clone());
    }

    /// The matcher placed (or buffered) a job.
    pub fn on_outcome(&self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Buffered => {}
            InsertOutcome::Created(m) => {
                self.metrics.record_match_created();
                self.matches.upsert_open(m);
            }
            InsertOutcome::Joined(m) => {
                self.metrics.record_match_extended();
                self.matches.upsert_open(m);
            }
        }
    }

    /// Hand frozen matches to the analyzer and aggregates. Matches that
    /// break an invariant are dropped; their violations are returned.
    pub fn on_frozen(&self, frozen: Vec<Match>) -> Vec<MonitorError> {
        let mut errors = Vec::new();
        for m in frozen {
            match self.analyzer.record(&m) {
                Ok(samples) => {
                    self.aggregates.record_match(&m);
                    self.metrics.record_frozen(samples.len() as u64);
                    self.matches.freeze(m);
                }
                Err(violation) => {
                    self.metrics.record_violation();
                    self.matches.discard(&m.match_id);
                    errors.push(MonitorError::Invariant(violation));
                }
            }
        }
        errors
    }

    /// The event-time watermark moved.
    pub fn on_watermark(&self, watermark: i64) {
        self.analyzer.observe_time(watermark);
        self.aggregates.observe_time(watermark);
        self.analyzer.prune();
    }
}

/// What happened to one ingested job.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub result: IngestionResult,
    /// Matches frozen as a consequence of the watermark moving.
    pub frozen: Vec<Match>,
    /// Per-event errors raised while folding frozen matches.
    pub errors: Vec<MonitorError>,
}

/// Single-threaded pipeline core.
pub struct CorrelationEngine {
    normalizer: Normalizer,
    ingester: JobIngester,
    matcher: Matcher,
    state: Arc<MonitorState>,
}

impl CorrelationEngine {
    /// Validate the configuration and build every stage.
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let normalizer = Normalizer::new(&config.sources)?;
        Ok(Self::with_normalizer(config, normalizer))
    }

    /// Build with a caller-supplied normalizer (e.g. one with a fixed clock).
    /// The configuration is assumed valid.
    pub fn with_normalizer(config: MonitorConfig, normalizer: Normalizer) -> Self {
        let ingester = JobIngester::new(IngesterConfig {
            dedup_window: config.pipeline.dedup_window,
        });
        let matcher = Matcher::new(config.matcher.clone());
        info!(sources = config.sources.len(), "CorrelationEngine initialized");
        Self {
            normalizer,
            ingester,
            matcher,
            state: Arc::new(MonitorState::new(config)),
        }
    }

    pub fn normalize(&self, source: &str, payload: &Value) -> Result<Job, SchemaMappingError> {
        self.normalizer.normalize(source, payload)
    }

    /// Normalize and ingest a delivered event. Mapping failures reject only
    /// this event.
    pub fn ingest_raw(&mut self, event: &RawEvent) -> Result<IngestReport, MonitorError> {
        self.state.metrics.record_received();
        let job = match self.normalizer.normalize_event(event) {
            Ok(job) => job,
            Err(e) => {
                self.state.metrics.record_rejected();
                warn!(source = %event.source, error = %e, "Rejected raw event");
                return Err(MonitorError::Mapping(e));
            }
        };
        Ok(self.process(job))
    }

    /// Feed a normalized job.
    pub fn ingest(&mut self, job: Job) -> IngestReport {
        self.state.metrics.record_received();
        self.process(job)
    }

    /// Move event time forward without a job, freezing what has elapsed.
    pub fn advance(&mut self, watermark: i64) -> Vec<Match> {
        let frozen = self.matcher.advance(watermark);
        self.state.on_watermark(watermark);
        let errors = self.state.on_frozen(frozen.clone());
        log_errors(&errors);
        frozen
    }

    /// Freeze every open match. Used on shutdown.
    pub fn flush(&mut self) -> Vec<Match> {
        let frozen = self.matcher.flush();
        let errors = self.state.on_frozen(frozen.clone());
        log_errors(&errors);
        info!(frozen = frozen.len(), "Engine flushed");
        frozen
    }

    pub fn query(&self) -> MonitorQuery {
        MonitorQuery::new(Arc::clone(&self.state))
    }

    pub fn state(&self) -> &Arc<MonitorState> {
        &self.state
    }

    fn process(&mut self, job: Job) -> IngestReport {
        let started = Instant::now();

        let result = self.ingester.ingest(&job);
        match result {
            IngestionResult::Accepted => {}
            IngestionResult::Dropped => self.state.metrics.record_duplicate(),
            IngestionResult::Rejected => self.state.metrics.record_rejected(),
        }
        if result != IngestionResult::Accepted {
            return IngestReport {
                result,
                frozen: Vec::new(),
                errors: Vec::new(),
            };
        }

        self.state.on_accepted(&job);
        let outcome = self.matcher.insert(job);
        self.state.on_outcome(outcome);

        let mut frozen = Vec::new();
        if let Some(watermark) = self.ingester.watermark() {
            frozen = self.matcher.advance(watermark);
            self.state.on_watermark(watermark);
        }
        let errors = self.state.on_frozen(frozen.clone());
        log_errors(&errors);

        self.state
            .metrics
            .record_processing(started.elapsed().as_nanos() as u64);

        IngestReport {
            result: IngestionResult::Accepted,
            frozen,
            errors,
        }
    }
}

fn log_errors(errors: &[MonitorError]) {
    for e in errors {
        warn!(error = %e, "Per-event error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_types::ids::SourceId;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn job(source: &str, job_id: &str, observed_at: i64) -> Job {
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
            clean_jobs: true,
            mining_pool: "Foundry USA".to_string(),
            coinbase_tx: "cb".to_string(),
            merkle_branches: vec!["aa".to_string()],
            metadata: BTreeMap::new(),
        }
    }

    fn engine() -> CorrelationEngine {
        CorrelationEngine::new(MonitorConfig::default()).unwrap()
    }

    #[test]
    fn test_match_freezes_when_watermark_passes() {
        let mut e = engine();
        e.ingest(job("a", "1", 0));
        e.ingest(job("b", "2", 150));
        assert_eq!(e.state().matches.open_count(), 1);

        let report = e.ingest(job("c", "9", 400_000));
        assert_eq!(report.frozen.len(), 1);
        assert_eq!(e.state().matches.open_count(), 0);
        assert_eq!(e.state().matches.frozen_count(), 1);
        assert_eq!(e.state().analyzer.samples_recorded(), 1);
    }

    #[test]
    fn test_out_of_range_job_rejected_without_panic() {
        let mut e = engine();
        e.ingest(job("a", "1", 1_000));
        let report = e.ingest(job("b", "2", i64::MIN + 10));
        assert_eq!(report.result, IngestionResult::Rejected);

        let report = e.ingest(job("c", "3", i64::MAX));
        assert_eq!(report.result, IngestionResult::Rejected);
        assert!(e.flush().is_empty());
        assert_eq!(e.state().jobs.len(), 1);
        assert_eq!(e.state().metrics.export()["events_rejected"], 2);
    }

    #[test]
    fn test_duplicate_is_dropped() {
        let mut e = engine();
        e.ingest(job("a", "1", 0));
        let report = e.ingest(job("a", "1", 0));
        assert_eq!(report.result, IngestionResult::Dropped);
        assert_eq!(e.state().jobs.len(), 1);
        assert_eq!(e.state().metrics.export()["jobs_duplicate"], 1);
    }

    #[test]
    fn test_rejected_raw_event() {
        let mut e = engine();
        let event = RawEvent {
            source: "miningpool.observer".to_string(),
            payload: json!({ "params": [] }),
            received_at: Some(0),
            region: None,
        };
        assert!(matches!(e.ingest_raw(&event), Err(MonitorError::Mapping(_))));
        assert_eq!(e.state().metrics.export()["events_rejected"], 1);
        assert!(e.state().jobs.is_empty());
    }

    #[test]
    fn test_flush_hands_off_open_matches() {
        let mut e = engine();
        e.ingest(job("a", "1", 0));
        e.ingest(job("b", "2", 150));
        let frozen = e.flush();
        assert_eq!(frozen.len(), 1);
        assert_eq!(e.state().aggregates.snapshot().agreement_counts["a+b"], 1);
    }
}
