//! Aggregate store
//!
//! Incrementally maintained read models over the job and match streams:
//! per-pool and per-height counters, per-source health and agreement rates,
//! per-combination agreement counts, block version distributions, pool job
//! frequency, and the regions each service and pool was seen from. Each update touches a bounded number
//! of keys; nothing is recomputed from history.
//!
//! Keys are guarded individually by `DashMap` entry locks, so concurrent
//! folds for different pools or heights never serialize on one another and
//! folds for the same key never lose updates.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use monitor_types::correlation::Match;
use monitor_types::ids::SourceId;
use monitor_types::job::Job;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AggregateConfig;

/// Rolling counters for one mining pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolAggregate {
    pub job_count: u64,
    /// Jobs that ended up in a frozen match.
    pub matched_jobs: u64,
    pub sources: BTreeSet<SourceId>,
    pub last_height: u64,
    pub last_seen: i64,
}

impl PoolAggregate {
    pub fn match_rate(&self) -> f64 {
        ratio(self.matched_jobs, self.job_count)
    }
}

/// Rolling counters for one block height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeightAggregate {
    pub height: u64,
    pub first_seen: i64,
    pub first_source: SourceId,
    pub last_seen: i64,
    pub job_count: u64,
    pub match_count: u64,
    pub sources: BTreeSet<SourceId>,
    pub pools: BTreeSet<String>,
}

impl HeightAggregate {
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

/// Streaming gap statistics (Welford), O(1) per observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterArrivalStats {
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: i64,
    pub max_ms: i64,
    #[serde(skip)]
    m2: f64,
}

impl InterArrivalStats {
    pub fn record(&mut self, gap_ms: i64) {
        self.count += 1;
        if self.count == 1 {
            self.min_ms = gap_ms;
            self.max_ms = gap_ms;
        } else {
            self.min_ms = self.min_ms.min(gap_ms);
            self.max_ms = self.max_ms.max(gap_ms);
        }
        let x = gap_ms as f64;
        let delta = x - self.mean_ms;
        self.mean_ms += delta / self.count as f64;
        self.m2 += delta * (x - self.mean_ms);
    }

    /// Population standard deviation.
    pub fn stddev_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).sqrt()
        }
    }
}

#[derive(Debug, Default)]
struct SourceState {
    job_count: u64,
    matched_jobs: u64,
    last_seen: Option<i64>,
    inter_arrival: InterArrivalStats,
    /// Bucket start → (jobs observed, jobs later matched).
    agreement: BTreeMap<i64, (u64, u64)>,
}

/// Point-in-time view of one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub job_count: u64,
    pub matched_jobs: u64,
    pub last_seen: Option<i64>,
    /// No job within the staleness bound of the newest event time.
    pub degraded: bool,
    pub agreement_rate: f64,
    pub inter_arrival: InterArrivalStats,
    pub inter_arrival_stddev_ms: f64,
}

/// Region label used when a job carries no target region.
pub const UNKNOWN_REGION: &str = "unknown";

/// Which regions services and pools were observed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionSnapshot {
    /// Source → target region → jobs observed there.
    pub service_regions: BTreeMap<SourceId, BTreeMap<String, u64>>,
    /// Pool → target region → jobs observed there.
    pub pool_regions: BTreeMap<String, BTreeMap<String, u64>>,
    /// Target region → pools seen there.
    pub region_pools: BTreeMap<String, BTreeSet<String>>,
}

impl RegionSnapshot {
    pub fn all_regions(&self) -> BTreeSet<String> {
        self.region_pools.keys().cloned().collect()
    }

    /// Pools seen in exactly one region, grouped by that region.
    pub fn exclusive_pools(&self) -> BTreeMap<String, Vec<String>> {
        let mut exclusive: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (pool, regions) in &self.pool_regions {
            if let (1, Some(region)) = (regions.len(), regions.keys().next()) {
                exclusive.entry(region.clone()).or_default().push(pool.clone());
            }
        }
        exclusive
    }
}

/// Everything the aggregate store knows, copied out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub pools: BTreeMap<String, PoolAggregate>,
    pub heights: BTreeMap<u64, HeightAggregate>,
    pub agreement_rates: BTreeMap<SourceId, f64>,
    pub sources: BTreeMap<SourceId, SourceSnapshot>,
    /// Source combination (`a+b+c`) → frozen matches with exactly that set.
    pub agreement_counts: BTreeMap<String, u64>,
    /// Source → block version → jobs announcing it.
    pub version_distribution: BTreeMap<SourceId, BTreeMap<String, u64>>,
    /// Pool → jobs per minute over the rolling window.
    pub job_frequency_per_minute: BTreeMap<String, f64>,
    pub regions: RegionSnapshot,
}

impl AggregateSnapshot {
    pub fn degraded_sources(&self) -> Vec<SourceId> {
        self.sources
            .iter()
            .filter(|(_, s)| s.degraded)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Incrementally updated aggregate read models.
pub struct AggregateStore {
    config: AggregateConfig,
    pools: DashMap<String, PoolAggregate>,
    heights: DashMap<u64, HeightAggregate>,
    /// Height insertion order, for bounded eviction.
    height_order: Mutex<VecDeque<u64>>,
    sources: DashMap<SourceId, SourceState>,
    agreement_counts: DashMap<String, u64>,
    versions: DashMap<SourceId, BTreeMap<String, u64>>,
    /// Pool → bucket start → jobs, trimmed to the rolling window.
    pool_activity: DashMap<String, BTreeMap<i64, u64>>,
    service_regions: DashMap<SourceId, BTreeMap<String, u64>>,
    pool_regions: DashMap<String, BTreeMap<String, u64>>,
    region_pools: DashMap<String, BTreeSet<String>>,
    clock_ms: AtomicI64,
}

impl AggregateStore {
    pub fn new(config: AggregateConfig) -> Self {
        info!(
            agreement_window_ms = config.agreement_window_ms,
            max_heights = config.max_heights,
            "AggregateStore initialized"
        );
        Self {
            config,
            pools: DashMap::new(),
            heights: DashMap::new(),
            height_order: Mutex::new(VecDeque::new()),
            sources: DashMap::new(),
            agreement_counts: DashMap::new(),
            versions: DashMap::new(),
            pool_activity: DashMap::new(),
            service_regions: DashMap::new(),
            pool_regions: DashMap::new(),
            region_pools: DashMap::new(),
            clock_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Fold one accepted job.
    pub fn record_job(&self, job: &Job) {
        self.observe_time(job.observed_at);

        {
            let mut pool = self.pools.entry(job.mining_pool.clone()).or_default();
            pool.job_count += 1;
            pool.sources.insert(job.source.clone());
            if job.observed_at >= pool.last_seen {
                pool.last_seen = job.observed_at;
                pool.last_height = job.height;
            }
        }

        let new_height = {
            let mut is_new = false;
            let mut h = self.heights.entry(job.height).or_insert_with(|| {
                is_new = true;
                HeightAggregate {
                    height: job.height,
                    first_seen: job.observed_at,
                    first_source: job.source.clone(),
                    last_seen: job.observed_at,
                    job_count: 0,
                    match_count: 0,
                    sources: BTreeSet::new(),
                    pools: BTreeSet::new(),
                }
            });
            h.job_count += 1;
            if job.observed_at < h.first_seen {
                h.first_seen = job.observed_at;
                h.first_source = job.source.clone();
            }
            h.last_seen = h.last_seen.max(job.observed_at);
            h.sources.insert(job.source.clone());
            h.pools.insert(job.mining_pool.clone());
            is_new
        };
        if new_height {
            self.track_height(job.height);
        }

        let horizon = self.agreement_horizon();
        let bucket = self.agreement_bucket(job.observed_at);

        {
            let mut activity = self.pool_activity.entry(job.mining_pool.clone()).or_default();
            *activity.entry(bucket).or_insert(0) += 1;
            if let Some(h) = horizon {
                let kept = activity.split_off(&h);
                *activity = kept;
            }
        }
        *self
            .versions
            .entry(job.source.clone())
            .or_default()
            .entry(job.version.clone())
            .or_insert(0) += 1;
        self.record_region(job);

        let mut source = self.sources.entry(job.source.clone()).or_default();
        source.job_count += 1;
        match source.last_seen {
            Some(last) if job.observed_at > last => {
                source.inter_arrival.record(job.observed_at.saturating_sub(last));
                source.last_seen = Some(job.observed_at);
            }
            Some(_) => {}
            None => source.last_seen = Some(job.observed_at),
        }
        source.agreement.entry(bucket).or_insert((0, 0)).0 += 1;
        if let Some(h) = horizon {
            let kept = source.agreement.split_off(&h);
            source.agreement = kept;
        }
    }

    /// Fold one frozen match.
    pub fn record_match(&self, m: &Match) {
        for job in m.jobs() {
            if let Some(mut pool) = self.pools.get_mut(&job.mining_pool) {
                pool.matched_jobs += 1;
            }
            let bucket = self.agreement_bucket(job.observed_at);
            if let Some(mut source) = self.sources.get_mut(&job.source) {
                source.matched_jobs += 1;
                if let Some(counts) = source.agreement.get_mut(&bucket) {
                    counts.1 += 1;
                }
            }
        }

        if let Some(mut h) = self.heights.get_mut(&m.key.height) {
            h.match_count += 1;
        }

        let combination = m
            .sources()
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("+");
        *self.agreement_counts.entry(combination).or_insert(0) += 1;

        debug!(match_id = %m.match_id, height = m.key.height, members = m.len(), "Match folded into aggregates");
    }

    fn record_region(&self, job: &Job) {
        let region = job.target_region().unwrap_or(UNKNOWN_REGION);
        *self
            .service_regions
            .entry(job.source.clone())
            .or_default()
            .entry(region.to_string())
            .or_insert(0) += 1;
        *self
            .pool_regions
            .entry(job.mining_pool.clone())
            .or_default()
            .entry(region.to_string())
            .or_insert(0) += 1;
        self.region_pools
            .entry(region.to_string())
            .or_default()
            .insert(job.mining_pool.clone());
    }

    pub fn observe_time(&self, now_ms: i64) {
        self.clock_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn pool(&self, name: &str) -> Option<PoolAggregate> {
        self.pools.get(name).map(|p| p.value().clone())
    }

    pub fn height(&self, height: u64) -> Option<HeightAggregate> {
        self.heights.get(&height).map(|h| h.value().clone())
    }

    /// Fraction of the source's jobs in the rolling window that were matched.
    pub fn agreement_rate(&self, source: &SourceId) -> f64 {
        self.sources
            .get(source)
            .map(|s| self.rate_of(&s))
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        let now = self.now_ms();

        let pools = self
            .pools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let heights = self
            .heights
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut agreement_rates = BTreeMap::new();
        let mut sources = BTreeMap::new();
        for entry in self.sources.iter() {
            let state = entry.value();
            let rate = self.rate_of(state);
            let degraded = match (now, state.last_seen) {
                (Some(now), Some(last)) => now.saturating_sub(last) > self.config.source_stale_after_ms,
                _ => false,
            };
            agreement_rates.insert(entry.key().clone(), rate);
            sources.insert(
                entry.key().clone(),
                SourceSnapshot {
                    job_count: state.job_count,
                    matched_jobs: state.matched_jobs,
                    last_seen: state.last_seen,
                    degraded,
                    agreement_rate: rate,
                    inter_arrival: state.inter_arrival.clone(),
                    inter_arrival_stddev_ms: state.inter_arrival.stddev_ms(),
                },
            );
        }

        let agreement_counts = self
            .agreement_counts
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();

        let horizon = self.agreement_horizon();
        let job_frequency_per_minute = self
            .pool_activity
            .iter()
            .map(|e| (e.key().clone(), self.jobs_per_minute(e.value(), now, horizon)))
            .collect();

        AggregateSnapshot {
            pools,
            heights,
            agreement_rates,
            sources,
            agreement_counts,
            version_distribution: copy_map(&self.versions),
            job_frequency_per_minute,
            regions: RegionSnapshot {
                service_regions: copy_map(&self.service_regions),
                pool_regions: copy_map(&self.pool_regions),
                region_pools: copy_map(&self.region_pools),
            },
        }
    }

    fn now_ms(&self) -> Option<i64> {
        let now = self.clock_ms.load(Ordering::Relaxed);
        (now != i64::MIN).then_some(now)
    }

    fn agreement_bucket(&self, ts: i64) -> i64 {
        ts.div_euclid(self.config.agreement_bucket_ms)
            .saturating_mul(self.config.agreement_bucket_ms)
    }

    fn agreement_horizon(&self) -> Option<i64> {
        self.now_ms()
            .map(|now| self.agreement_bucket(now.saturating_sub(self.config.agreement_window_ms)))
    }

    /// Jobs per minute over the part of the rolling window the pool has
    /// been active in.
    fn jobs_per_minute(&self, activity: &BTreeMap<i64, u64>, now: Option<i64>, horizon: Option<i64>) -> f64 {
        let (Some(now), Some(from)) = (now, horizon) else {
            return 0.0;
        };
        let mut in_window = activity.range(from..).peekable();
        let Some(oldest) = in_window.peek().map(|(bucket, _)| **bucket) else {
            return 0.0;
        };
        let count: u64 = in_window.map(|(_, n)| n).sum();
        let span_ms = now
            .saturating_sub(oldest)
            .min(self.config.agreement_window_ms)
            .max(self.config.agreement_bucket_ms)
            .max(1);
        count as f64 * 60_000.0 / span_ms as f64
    }

    fn rate_of(&self, state: &SourceState) -> f64 {
        let from = self.agreement_horizon().unwrap_or(i64::MIN);
        let (total, matched) = state
            .agreement
            .range(from..)
            .fold((0, 0), |(t, m), (_, (bt, bm))| (t + bt, m + bm));
        ratio(matched, total)
    }

    fn track_height(&self, height: u64) {
        let evicted = {
            let mut order = match self.height_order.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            order.push_back(height);
            let mut evicted = Vec::new();
            while order.len() > self.config.max_heights {
                if let Some(old) = order.pop_front() {
                    evicted.push(old);
                }
            }
            evicted
        };
        for old in evicted {
            self.heights.remove(&old);
            debug!(height = old, "Height aggregate evicted");
        }
    }
}

fn copy_map<K, V>(map: &DashMap<K, V>) -> BTreeMap<K, V>
where
    K: Ord + Clone + std::hash::Hash + Eq,
    V: Clone,
{
    map.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
