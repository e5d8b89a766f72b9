//! Propagation analyzer
//!
//! Turns frozen matches into per-pair delay samples and answers statistics
//! queries over them. Samples are retained per canonical [`ServicePair`],
//! ordered by attribution time, so statistics for any queried range are
//! exact (median included). Retention is bounded in event time.
//!
//! Matches whose jobs were collected in different target regions also feed
//! a directional region-pair series keyed `first-second`, where `first` is
//! the region of the earlier observation.
//!
//! Every series lives behind its own `DashMap` shard lock; shards of the
//! pipeline may fold matches concurrently without losing updates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use monitor_types::correlation::Match;
use monitor_types::errors::InvariantViolation;
use monitor_types::ids::{ServicePair, SourceId};
use monitor_types::propagation::{HistoryBucket, PairStats, PropagationSample};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::PropagationConfig;

/// How often a source was first to observe a matched job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstProviderStats {
    pub count: u64,
    /// Share of all analyzed matches, 0..=100.
    pub percentage: f64,
}

/// Align a timestamp to the start of its bucket.
pub fn bucket_start(timestamp_ms: i64, width_ms: i64) -> i64 {
    timestamp_ms.div_euclid(width_ms).saturating_mul(width_ms)
}

/// Build one sample per distinct-source pair of jobs in the match.
pub fn samples_for(m: &Match, bucket_width_ms: i64) -> Vec<PropagationSample> {
    let jobs: Vec<_> = m.jobs().collect();
    let mut samples = Vec::with_capacity(jobs.len() * jobs.len().saturating_sub(1) / 2);

    for (i, a) in jobs.iter().enumerate() {
        for b in &jobs[i + 1..] {
            let Some(pair) = ServicePair::new(a.source.clone(), b.source.clone()) else {
                continue;
            };
            let (first, second) = if &a.source == pair.first() { (a, b) } else { (b, a) };
            let signed = second.observed_at.saturating_sub(first.observed_at);
            let leader = if signed >= 0 {
                first.source.clone()
            } else {
                second.source.clone()
            };
            let attributed_at = a.observed_at.max(b.observed_at);

            samples.push(PropagationSample {
                match_id: m.match_id,
                service_pair: pair,
                leader,
                delta_ms: signed.saturating_abs(),
                signed_delta_ms: signed,
                attributed_at,
                bucket_timestamp: bucket_start(attributed_at, bucket_width_ms),
            });
        }
    }

    samples
}

/// Delay between two observations of one match made in different regions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSample {
    /// `first-second`, first being the region that observed earlier.
    pub region_pair: String,
    pub delta_ms: i64,
    pub attributed_at: i64,
}

/// One sample per pair of jobs whose target regions are known and differ.
pub fn region_samples_for(m: &Match) -> Vec<RegionSample> {
    let mut located: Vec<_> = m
        .jobs()
        .filter_map(|j| j.target_region().map(|r| (j, r)))
        .collect();
    located.sort_by(|(a, _), (b, _)| (a.observed_at, &a.source).cmp(&(b.observed_at, &b.source)));

    let mut samples = Vec::new();
    for (i, (a, first)) in located.iter().enumerate() {
        for (b, second) in &located[i + 1..] {
            if first == second {
                continue;
            }
            samples.push(RegionSample {
                region_pair: format!("{}-{}", first, second),
                delta_ms: b.observed_at.saturating_sub(a.observed_at),
                attributed_at: b.observed_at,
            });
        }
    }
    samples
}

/// Per-pair delay series with streaming ingestion and exact range queries.
pub struct PropagationAnalyzer {
    config: PropagationConfig,
    /// Pair → attributed_at → samples attributed at that instant.
    series: DashMap<ServicePair, BTreeMap<i64, Vec<PropagationSample>>>,
    /// Region pair → attributed_at → deltas.
    regions: DashMap<String, BTreeMap<i64, Vec<i64>>>,
    first_provider: DashMap<SourceId, u64>,
    matches_analyzed: AtomicU64,
    samples_recorded: AtomicU64,
    violations: AtomicU64,
    /// Newest event time seen, used as the default query horizon.
    clock_ms: AtomicI64,
}

impl PropagationAnalyzer {
    pub fn new(config: PropagationConfig) -> Self {
        info!(
            bucket_width_ms = config.bucket_width_ms,
            retention_ms = config.retention_ms,
            "PropagationAnalyzer initialized"
        );
        Self {
            config,
            series: DashMap::new(),
            regions: DashMap::new(),
            first_provider: DashMap::new(),
            matches_analyzed: AtomicU64::new(0),
            samples_recorded: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            clock_ms: AtomicI64::new(i64::MIN),
        }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Fold a frozen match into the series.
    ///
    /// A match that breaks the matcher's structural invariants yields no
    /// samples; the violation is logged and returned for reporting.
    pub fn record(&self, m: &Match) -> Result<Vec<PropagationSample>, InvariantViolation> {
        if let Err(violation) = m.check_invariants() {
            self.violations.fetch_add(1, Ordering::Relaxed);
            error!(
                match_id = %m.match_id,
                key = %m.key,
                error = %violation,
                "Invariant violation, match dropped from propagation statistics"
            );
            return Err(violation);
        }

        let samples = samples_for(m, self.config.bucket_width_ms);
        let newest = samples.iter().map(|s| s.attributed_at).max().unwrap_or(i64::MIN);
        self.observe_time(newest);
        let horizon = self.retention_horizon();

        for sample in &samples {
            let mut series = self.series.entry(sample.service_pair.clone()).or_default();
            series.entry(sample.attributed_at).or_default().push(sample.clone());
            if let Some(h) = horizon {
                trim_before(&mut series, h);
            }
        }

        for sample in region_samples_for(m) {
            let mut series = self.regions.entry(sample.region_pair).or_default();
            series.entry(sample.attributed_at).or_default().push(sample.delta_ms);
            if let Some(h) = horizon {
                let kept = series.split_off(&h);
                *series = kept;
            }
        }

        *self
            .first_provider
            .entry(m.primary_job.source.clone())
            .or_insert(0) += 1;
        self.matches_analyzed.fetch_add(1, Ordering::Relaxed);
        self.samples_recorded
            .fetch_add(samples.len() as u64, Ordering::Relaxed);

        debug!(
            match_id = %m.match_id,
            first = %m.primary_job.source,
            samples = samples.len(),
            "Match analyzed"
        );

        Ok(samples)
    }

    /// Advance the query horizon without recording a sample.
    pub fn observe_time(&self, now_ms: i64) {
        self.clock_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Newest event time observed, if any.
    pub fn now_ms(&self) -> Option<i64> {
        let now = self.clock_ms.load(Ordering::Relaxed);
        (now != i64::MIN).then_some(now)
    }

    /// Drop samples outside the retention horizon across every pair.
    pub fn prune(&self) {
        let Some(horizon) = self.retention_horizon() else {
            return;
        };
        for mut entry in self.series.iter_mut() {
            trim_before(entry.value_mut(), horizon);
        }
        self.series.retain(|_, s| !s.is_empty());
        for mut entry in self.regions.iter_mut() {
            let kept = entry.value_mut().split_off(&horizon);
            *entry.value_mut() = kept;
        }
        self.regions.retain(|_, s| !s.is_empty());
    }

    /// Time-bucketed statistics for `pair` over `(until - lookback, until]`.
    ///
    /// Only buckets holding samples are returned, oldest first. A pair with
    /// no samples yields an empty list.
    pub fn history_until(
        &self,
        pair: &ServicePair,
        lookback_ms: i64,
        bucket_width_ms: i64,
        until_ms: i64,
    ) -> Vec<HistoryBucket> {
        let width = if bucket_width_ms > 0 {
            bucket_width_ms
        } else {
            self.config.bucket_width_ms
        };

        let mut grouped: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        self.for_range(pair, lookback_ms, until_ms, |s| {
            grouped
                .entry(bucket_start(s.attributed_at, width))
                .or_default()
                .push(s.delta_ms);
        });

        grouped
            .into_iter()
            .map(|(bucket_timestamp, deltas)| HistoryBucket {
                bucket_timestamp,
                stats: PairStats::from_deltas(&deltas),
            })
            .collect()
    }

    /// [`history_until`](Self::history_until) ending at the newest event time.
    pub fn history(&self, pair: &ServicePair, lookback_ms: i64, bucket_width_ms: i64) -> Vec<HistoryBucket> {
        match self.now_ms() {
            Some(now) => self.history_until(pair, lookback_ms, bucket_width_ms, now),
            None => Vec::new(),
        }
    }

    /// Statistics over every retained sample of `pair` in the lookback range.
    /// Zeroed when there are none.
    pub fn summary(&self, pair: &ServicePair, lookback_ms: i64) -> PairStats {
        let Some(until) = self.now_ms() else {
            return PairStats::empty();
        };
        let mut deltas = Vec::new();
        self.for_range(pair, lookback_ms, until, |s| deltas.push(s.delta_ms));
        PairStats::from_deltas(&deltas)
    }

    /// Raw samples for `pair`, oldest first.
    pub fn samples(&self, pair: &ServicePair) -> Vec<PropagationSample> {
        self.series
            .get(pair)
            .map(|s| s.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pairs(&self) -> BTreeSet<ServicePair> {
        self.series.iter().map(|e| e.key().clone()).collect()
    }

    /// Region pairs with retained samples.
    pub fn region_pairs(&self) -> BTreeSet<String> {
        self.regions.iter().map(|e| e.key().clone()).collect()
    }

    /// Statistics for one `first-second` region pair over the lookback range.
    /// Zeroed when there are none.
    pub fn region_summary(&self, region_pair: &str, lookback_ms: i64) -> PairStats {
        let Some(until) = self.now_ms() else {
            return PairStats::empty();
        };
        if lookback_ms <= 0 {
            return PairStats::empty();
        }
        let from = until.saturating_sub(lookback_ms);
        if from >= until {
            return PairStats::empty();
        }
        let deltas: Vec<i64> = self
            .regions
            .get(region_pair)
            .map(|series| {
                series
                    .range(from + 1..=until)
                    .flat_map(|(_, d)| d.iter().copied())
                    .collect()
            })
            .unwrap_or_default();
        PairStats::from_deltas(&deltas)
    }

    /// [`region_summary`](Self::region_summary) for every region pair with
    /// samples in range.
    pub fn region_stats(&self, lookback_ms: i64) -> BTreeMap<String, PairStats> {
        self.region_pairs()
            .into_iter()
            .map(|key| {
                let stats = self.region_summary(&key, lookback_ms);
                (key, stats)
            })
            .filter(|(_, stats)| !stats.is_empty())
            .collect()
    }

    pub fn first_provider_stats(&self) -> BTreeMap<SourceId, FirstProviderStats> {
        let total = self.matches_analyzed.load(Ordering::Relaxed);
        self.first_provider
            .iter()
            .map(|e| {
                let count = *e.value();
                let percentage = if total == 0 {
                    0.0
                } else {
                    count as f64 * 100.0 / total as f64
                };
                (e.key().clone(), FirstProviderStats { count, percentage })
            })
            .collect()
    }

    pub fn matches_analyzed(&self) -> u64 {
        self.matches_analyzed.load(Ordering::Relaxed)
    }

    pub fn samples_recorded(&self) -> u64 {
        self.samples_recorded.load(Ordering::Relaxed)
    }

    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    fn for_range(&self, pair: &ServicePair, lookback_ms: i64, until_ms: i64, mut f: impl FnMut(&PropagationSample)) {
        if lookback_ms <= 0 {
            return;
        }
        let Some(series) = self.series.get(pair) else {
            return;
        };
        // Saturated at i64::MIN, the range would be inverted.
        let from = until_ms.saturating_sub(lookback_ms);
        if from >= until_ms {
            return;
        }
        for samples in series.range(from + 1..=until_ms).map(|(_, v)| v) {
            samples.iter().for_each(&mut f);
        }
    }

    fn retention_horizon(&self) -> Option<i64> {
        self.now_ms()
            .map(|now| now.saturating_sub(self.config.retention_ms))
    }
}

fn trim_before(series: &mut BTreeMap<i64, Vec<PropagationSample>>, horizon: i64) {
    let kept = series.split_off(&horizon);
    *series = kept;
}
