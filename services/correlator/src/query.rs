//! Read-only query interface
//!
//! The only surface the presentation layer depends on. Every accessor
//! returns owned copies; nothing here mutates pipeline state or fails. An
//! unknown or malformed pair key yields an empty result.

use std::collections::BTreeMap;
use std::sync::Arc;

use monitor_types::correlation::{Match, MatchStatus};
use monitor_types::ids::{MatchId, ServicePair, SourceId};
use monitor_types::job::Job;
use monitor_types::propagation::{HistoryBucket, PairStats};
use serde::{Deserialize, Serialize};

use crate::aggregates::AggregateSnapshot;
use crate::engine::MonitorState;
use crate::propagation::FirstProviderStats;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Zero-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page: usize,
    pub page_size: usize,
}

impl Page {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self { page, page_size }
    }

    fn bounds(&self) -> (usize, usize) {
        let size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        (self.page.saturating_mul(size), size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 0,
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub source: Option<SourceId>,
    pub mining_pool: Option<String>,
    pub height: Option<u64>,
}

impl JobFilter {
    fn accepts(&self, job: &Job) -> bool {
        self.source.as_ref().map_or(true, |s| &job.source == s)
            && self.mining_pool.as_ref().map_or(true, |p| &job.mining_pool == p)
            && self.height.map_or(true, |h| job.height == h)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFilter {
    /// Matches in which this source participates.
    pub source: Option<SourceId>,
    pub height: Option<u64>,
    pub status: Option<MatchStatus>,
}

impl MatchFilter {
    fn accepts(&self, m: &Match) -> bool {
        self.source.as_ref().map_or(true, |s| m.contains_source(s))
            && self.height.map_or(true, |h| m.key.height == h)
            && self.status.map_or(true, |s| m.status == s)
    }
}

/// Cheap, cloneable read handle over the pipeline's state.
#[derive(Clone)]
pub struct MonitorQuery {
    state: Arc<MonitorState>,
}

impl MonitorQuery {
    pub fn new(state: Arc<MonitorState>) -> Self {
        Self { state }
    }

    /// Retained jobs, newest first.
    pub fn list_jobs(&self, filter: &JobFilter, page: Page) -> Vec<Job> {
        let (skip, take) = page.bounds();
        self.state.jobs.collect_newest(|j| filter.accepts(j), skip, take)
    }

    /// Open matches then frozen ones, newest first.
    pub fn list_matches(&self, filter: &MatchFilter, page: Page) -> Vec<Match> {
        let (skip, take) = page.bounds();
        self.state
            .matches
            .collect_newest(|m| filter.accepts(m))
            .into_iter()
            .skip(skip)
            .take(take)
            .collect()
    }

    pub fn get_match(&self, id: &MatchId) -> Option<Match> {
        self.state.matches.get(id)
    }

    /// Bucketed delay statistics for a `a|b` pair key. Lookback and bucket
    /// width fall back to the configured defaults.
    pub fn propagation_history(
        &self,
        pair_key: &str,
        lookback_ms: Option<i64>,
        bucket_width_ms: Option<i64>,
    ) -> Vec<HistoryBucket> {
        let Some(pair) = ServicePair::parse(pair_key) else {
            return Vec::new();
        };
        let defaults = self.state.analyzer.config();
        let lookback = lookback_ms.filter(|l| *l > 0).unwrap_or(defaults.default_lookback_ms);
        let width = bucket_width_ms.filter(|w| *w > 0).unwrap_or(defaults.bucket_width_ms);
        self.state.analyzer.history(&pair, lookback, width)
    }

    /// Whole-range statistics for a pair. Zeroed when nothing is known.
    pub fn propagation_summary(&self, pair_key: &str, lookback_ms: Option<i64>) -> PairStats {
        let Some(pair) = ServicePair::parse(pair_key) else {
            return PairStats::empty();
        };
        self.state.analyzer.summary(&pair, self.lookback(lookback_ms))
    }

    /// Every pair with retained samples, as `a|b` keys.
    pub fn service_pairs(&self) -> Vec<String> {
        self.state.analyzer.pairs().iter().map(|p| p.key()).collect()
    }

    /// Delay statistics per `first-second` region pair.
    pub fn region_propagation(&self, lookback_ms: Option<i64>) -> BTreeMap<String, PairStats> {
        self.state.analyzer.region_stats(self.lookback(lookback_ms))
    }

    /// Statistics for one region pair. Zeroed when nothing is known.
    pub fn region_summary(&self, region_pair: &str, lookback_ms: Option<i64>) -> PairStats {
        self.state
            .analyzer
            .region_summary(region_pair, self.lookback(lookback_ms))
    }

    pub fn first_providers(&self) -> BTreeMap<SourceId, FirstProviderStats> {
        self.state.analyzer.first_provider_stats()
    }

    pub fn aggregates(&self) -> AggregateSnapshot {
        self.state.aggregates.snapshot()
    }

    pub fn metrics(&self) -> BTreeMap<String, u64> {
        self.state.metrics.export()
    }

    fn lookback(&self, lookback_ms: Option<i64>) -> i64 {
        lookback_ms
            .filter(|l| *l > 0)
            .unwrap_or(self.state.analyzer.config().default_lookback_ms)
    }
}
