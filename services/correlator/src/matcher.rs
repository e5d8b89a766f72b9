//! Sliding-window matcher
//!
//! Correlates jobs from distinct sources that denote the same upstream job.
//! Jobs are bucketed by [`JobKey`]; within a bucket each arriving job is
//! scored against every buffered job from another source and joins (or
//! founds) the match of the best admissible candidate.
//!
//! Time is event time: the matcher's clock is the highest `observed_at` it
//! has seen (or been advanced to). A match freezes once that watermark passes
//! `primary.observed_at + window`; a bucket freezes once it holds neither
//! live jobs nor open matches, and is then discarded. A later job with the
//! same key opens a fresh bucket generation.

use std::collections::{HashMap, VecDeque};

use monitor_types::correlation::{Match, MatchStatus, MatchedJob};
use monitor_types::ids::{JobKey, MatchId, SourceId};
use monitor_types::job::Job;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{MatcherConfig, ScoreWeights};

type Fingerprint = [u8; 32];

/// A job plus the digests used for scoring.
#[derive(Debug, Clone)]
struct ScoredJob {
    job: Job,
    coinbase: Fingerprint,
    merkle: Fingerprint,
}

impl ScoredJob {
    fn new(job: Job, coinbase_prefix_chars: Option<usize>) -> Self {
        let coinbase_src = match coinbase_prefix_chars {
            Some(n) => job.coinbase_tx.get(..n).unwrap_or(&job.coinbase_tx),
            None => job.coinbase_tx.as_str(),
        };
        let coinbase: Fingerprint = Sha256::digest(coinbase_src.as_bytes()).into();

        let mut hasher = Sha256::new();
        for branch in &job.merkle_branches {
            hasher.update(branch.as_bytes());
            hasher.update([0u8]);
        }
        let merkle: Fingerprint = hasher.finalize().into();

        Self { job, coinbase, merkle }
    }
}

/// Sum of the weights of the structural fields on which `a` and `b` agree.
fn similarity(weights: &ScoreWeights, a: &ScoredJob, b: &ScoredJob) -> u32 {
    let mut score = 0;
    if a.job.version == b.job.version {
        score += weights.version;
    }
    if a.job.bits == b.job.bits {
        score += weights.bits;
    }
    if a.job.clean_jobs == b.job.clean_jobs {
        score += weights.clean_jobs;
    }
    if a.coinbase == b.coinbase {
        score += weights.coinbase_tx;
    }
    if a.merkle == b.merkle {
        score += weights.merkle_branches;
    }
    score
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Unmatched,
    Open(MatchId),
    /// Belonged to a match that has since frozen.
    Closed,
}

#[derive(Debug)]
struct BufferedJob {
    scored: ScoredJob,
    membership: Membership,
}

/// An open match together with its members' digests.
#[derive(Debug)]
struct OpenMatch {
    primary: ScoredJob,
    members: Vec<(ScoredJob, u32)>,
    match_id: MatchId,
}

impl OpenMatch {
    fn deadline(&self, window_ms: i64) -> i64 {
        self.primary.job.observed_at.saturating_add(window_ms)
    }

    fn contains_source(&self, source: &SourceId) -> bool {
        &self.primary.job.source == source || self.members.iter().any(|(m, _)| &m.job.source == source)
    }

    /// Add a job, promoting it to primary when it was observed first.
    fn admit(&mut self, job: ScoredJob, weights: &ScoreWeights) {
        if (job.job.observed_at, &job.job.source) < (self.primary.job.observed_at, &self.primary.job.source) {
            let old = std::mem::replace(&mut self.primary, job);
            self.members.push((old, 0));
            for (member, score) in &mut self.members {
                *score = similarity(weights, &self.primary, member);
            }
        } else {
            let score = similarity(weights, &self.primary, &job);
            self.members.push((job, score));
        }
        self.members
            .sort_by(|(a, _), (b, _)| (a.job.observed_at, &a.job.source).cmp(&(b.job.observed_at, &b.job.source)));
    }

    fn snapshot(&self, key: &JobKey, status: MatchStatus, frozen_at: Option<i64>) -> Match {
        Match {
            match_id: self.match_id,
            key: key.clone(),
            primary_job: self.primary.job.clone(),
            matched_jobs: self
                .members
                .iter()
                .map(|(m, score)| MatchedJob {
                    job: m.job.clone(),
                    score: *score,
                })
                .collect(),
            status,
            frozen_at,
        }
    }
}

/// Lifecycle of one key's bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketPhase {
    Collecting,
    Frozen,
}

struct Bucket {
    generation: u64,
    phase: BucketPhase,
    /// Live jobs in arrival order.
    jobs: VecDeque<BufferedJob>,
    open: HashMap<MatchId, OpenMatch>,
}

impl Bucket {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            phase: BucketPhase::Collecting,
            jobs: VecDeque::new(),
            open: HashMap::new(),
        }
    }
}

/// What happened to an inserted job.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// No admissible candidate; the job waits in the buffer.
    Buffered,
    /// The job founded a new match with an earlier arrival.
    Created(Match),
    /// The job joined an existing open match.
    Joined(Match),
}

impl InsertOutcome {
    pub fn updated_match(&self) -> Option<&Match> {
        match self {
            InsertOutcome::Buffered => None,
            InsertOutcome::Created(m) | InsertOutcome::Joined(m) => Some(m),
        }
    }
}

/// Sliding-window matcher over all keys routed to it.
pub struct Matcher {
    config: MatcherConfig,
    buckets: HashMap<JobKey, Bucket>,
    watermark: Option<i64>,
    next_generation: u64,
    evicted_jobs: u64,
}

impl Matcher {
    pub fn new(config: MatcherConfig) -> Self {
        info!(
            window_ms = config.window_ms,
            threshold = config.threshold,
            max_jobs_per_bucket = config.max_jobs_per_bucket,
            "Matcher initialized"
        );
        Self {
            config,
            buckets: HashMap::new(),
            watermark: None,
            next_generation: 0,
            evicted_jobs: 0,
        }
    }

    /// Score two jobs with this matcher's weights.
    pub fn score(&self, a: &Job, b: &Job) -> u32 {
        let prefix = self.config.coinbase_prefix_chars;
        similarity(
            &self.config.weights,
            &ScoredJob::new(a.clone(), prefix),
            &ScoredJob::new(b.clone(), prefix),
        )
    }

    /// Score the job against its bucket and record it. Reading the buffer and
    /// adding the job happen under one `&mut self` borrow.
    pub fn insert(&mut self, job: Job) -> InsertOutcome {
        let window = self.config.window_ms;
        let threshold = self.config.threshold;
        self.watermark = Some(self.watermark.map_or(job.observed_at, |w| w.max(job.observed_at)));

        let key = job.key();
        let scored = ScoredJob::new(job, self.config.coinbase_prefix_chars);

        let next_generation = &mut self.next_generation;
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            *next_generation += 1;
            debug!(key = %key, generation = *next_generation, "Bucket opened");
            Bucket::new(*next_generation)
        });

        // Rank every live job of another source within the window.
        let mut candidates: Vec<(u32, i64, usize)> = bucket
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, b)| b.scored.job.source != scored.job.source)
            .filter(|(_, b)| b.membership != Membership::Closed)
            .filter(|(_, b)| b.scored.job.observed_at.abs_diff(scored.job.observed_at) <= window.unsigned_abs())
            .map(|(i, b)| (similarity(&self.config.weights, &scored, &b.scored), b.scored.job.observed_at, i))
            .filter(|(score, _, _)| *score >= threshold)
            .collect();
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then_with(|| bucket.jobs[a.2].scored.job.source.cmp(&bucket.jobs[b.2].scored.job.source))
        });

        let mut outcome = InsertOutcome::Buffered;
        let mut membership = Membership::Unmatched;

        for (score, _, idx) in candidates {
            let candidate = &bucket.jobs[idx];
            match candidate.membership {
                Membership::Open(match_id) => {
                    let Some(open) = bucket.open.get_mut(&match_id) else {
                        continue;
                    };
                    if open.contains_source(&scored.job.source) {
                        continue;
                    }
                    let earliest = open.primary.job.observed_at.min(scored.job.observed_at);
                    let latest = open
                        .members
                        .iter()
                        .map(|(m, _)| m.job.observed_at)
                        .chain([open.primary.job.observed_at, scored.job.observed_at])
                        .max()
                        .unwrap_or(earliest);
                    if latest.saturating_sub(earliest) > window {
                        continue;
                    }

                    open.admit(scored.clone(), &self.config.weights);
                    debug!(
                        match_id = %match_id,
                        source = %scored.job.source,
                        job_id = %scored.job.job_id,
                        score,
                        members = open.members.len() + 1,
                        "Job joined match"
                    );
                    membership = Membership::Open(match_id);
                    outcome = InsertOutcome::Joined(open.snapshot(&key, MatchStatus::Collecting, None));
                    break;
                }
                Membership::Unmatched => {
                    let mut open = OpenMatch {
                        primary: candidate.scored.clone(),
                        members: Vec::new(),
                        match_id: MatchId::new(),
                    };
                    open.admit(scored.clone(), &self.config.weights);
                    let match_id = open.match_id;
                    debug!(
                        match_id = %match_id,
                        key = %key,
                        primary = %open.primary.job.source,
                        score,
                        "Match created"
                    );

                    outcome = InsertOutcome::Created(open.snapshot(&key, MatchStatus::Collecting, None));
                    bucket.open.insert(match_id, open);
                    bucket.jobs[idx].membership = Membership::Open(match_id);
                    membership = Membership::Open(match_id);
                    break;
                }
                Membership::Closed => continue,
            }
        }

        bucket.jobs.push_back(BufferedJob { scored, membership });

        if bucket.jobs.len() > self.config.max_jobs_per_bucket {
            if let Some(evicted) = bucket.jobs.pop_front() {
                self.evicted_jobs += 1;
                debug!(
                    key = %key,
                    source = %evicted.scored.job.source,
                    job_id = %evicted.scored.job.job_id,
                    "Bucket full, evicting oldest job"
                );
            }
        }

        outcome
    }

    /// Move the event-time watermark forward, freezing every match whose
    /// window has elapsed and evicting expired jobs.
    pub fn advance(&mut self, watermark: i64) -> Vec<Match> {
        let watermark = self.watermark.map_or(watermark, |w| w.max(watermark));
        self.watermark = Some(watermark);
        let window = self.config.window_ms;

        let mut frozen = Vec::new();
        for (key, bucket) in self.buckets.iter_mut() {
            let due: Vec<MatchId> = bucket
                .open
                .iter()
                .filter(|(_, m)| watermark > m.deadline(window))
                .map(|(id, _)| *id)
                .collect();
            for match_id in due {
                if let Some(open) = bucket.open.remove(&match_id) {
                    frozen.push(freeze(key, &mut bucket.jobs, open, watermark));
                }
            }

            bucket
                .jobs
                .retain(|b| b.scored.job.observed_at.saturating_add(window) >= watermark);

            if bucket.jobs.is_empty() && bucket.open.is_empty() {
                bucket.phase = BucketPhase::Frozen;
            }
        }

        self.drop_frozen_buckets();
        sort_frozen(&mut frozen);
        frozen
    }

    /// Freeze every open match regardless of its window and drop all state.
    pub fn flush(&mut self) -> Vec<Match> {
        let watermark = self.watermark.unwrap_or(0);
        let mut frozen = Vec::new();
        for (key, bucket) in self.buckets.iter_mut() {
            let open: Vec<OpenMatch> = bucket.open.drain().map(|(_, m)| m).collect();
            for m in open {
                frozen.push(freeze(key, &mut bucket.jobs, m, watermark));
            }
            bucket.jobs.clear();
            bucket.phase = BucketPhase::Frozen;
        }
        self.drop_frozen_buckets();
        sort_frozen(&mut frozen);

        info!(frozen = frozen.len(), "Matcher flushed");
        frozen
    }

    pub fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buffered_jobs(&self) -> usize {
        self.buckets.values().map(|b| b.jobs.len()).sum()
    }

    pub fn open_matches(&self) -> usize {
        self.buckets.values().map(|b| b.open.len()).sum()
    }

    pub fn evicted_jobs(&self) -> u64 {
        self.evicted_jobs
    }

    /// Phase and generation of the bucket currently held for `key`.
    pub fn bucket_state(&self, key: &JobKey) -> Option<(BucketPhase, u64)> {
        self.buckets.get(key).map(|b| (b.phase, b.generation))
    }

    fn drop_frozen_buckets(&mut self) {
        self.buckets.retain(|key, b| {
            let keep = b.phase == BucketPhase::Collecting;
            if !keep {
                debug!(key = %key, generation = b.generation, "Bucket frozen");
            }
            keep
        });
    }
}

fn freeze(key: &JobKey, jobs: &mut VecDeque<BufferedJob>, open: OpenMatch, at: i64) -> Match {
    for b in jobs.iter_mut() {
        if b.membership == Membership::Open(open.match_id) {
            b.membership = Membership::Closed;
        }
    }
    let m = open.snapshot(key, MatchStatus::Frozen, Some(at));
    debug!(
        match_id = %m.match_id,
        key = %key,
        members = m.len(),
        spread_ms = m.spread_ms(),
        "Match frozen"
    );
    m
}

/// Deterministic hand-off order: by primary observation, then id.
fn sort_frozen(frozen: &mut [Match]) {
    frozen.sort_by(|a, b| {
        (a.primary_job.observed_at, &a.primary_job.source, a.match_id).cmp(&(
            b.primary_job.observed_at,
            &b.primary_job.source,
            b.match_id,
        ))
    });
}
