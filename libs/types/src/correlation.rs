//! Match groups: jobs from distinct sources judged to be the same job

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::InvariantViolation;
use crate::ids::{JobKey, MatchId, SourceId};
use crate::job::Job;

/// Lifecycle of a match group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Window still open; further sources may join.
    Collecting,
    /// Window elapsed (or forced on shutdown); no job may join.
    Frozen,
}

/// A non-primary member of a match with its score against the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedJob {
    pub job: Job,
    pub score: u32,
}

/// A set of jobs from two or more distinct sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub match_id: MatchId,
    pub key: JobKey,
    /// Earliest-observed member.
    pub primary_job: Job,
    /// Remaining members ordered by `observed_at`.
    pub matched_jobs: Vec<MatchedJob>,
    pub status: MatchStatus,
    /// Event time at which the match was frozen.
    pub frozen_at: Option<i64>,
}

impl Match {
    /// All member jobs, primary first.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        std::iter::once(&self.primary_job).chain(self.matched_jobs.iter().map(|m| &m.job))
    }

    pub fn len(&self) -> usize {
        1 + self.matched_jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Distinct participating sources.
    pub fn sources(&self) -> BTreeSet<SourceId> {
        self.jobs().map(|j| j.source.clone()).collect()
    }

    pub fn contains_source(&self, source: &SourceId) -> bool {
        self.jobs().any(|j| &j.source == source)
    }

    pub fn is_frozen(&self) -> bool {
        self.status == MatchStatus::Frozen
    }

    /// Event time after which the match no longer accepts jobs.
    pub fn closes_at(&self, window_ms: i64) -> i64 {
        self.primary_job.observed_at.saturating_add(window_ms)
    }

    /// Spread between the first and last observation in the group.
    pub fn spread_ms(&self) -> i64 {
        let last = self.jobs().map(|j| j.observed_at).max().unwrap_or(self.primary_job.observed_at);
        last.saturating_sub(self.primary_job.observed_at)
    }

    /// Validate the structural invariants of a match group.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut seen = BTreeSet::new();
        for job in self.jobs() {
            if job.height != self.key.height || job.prev_block_hash != self.key.prev_block_hash {
                return Err(InvariantViolation::KeyMismatch {
                    match_id: self.match_id.to_string(),
                    source_id: job.source.to_string(),
                });
            }
            if !seen.insert(job.source.clone()) {
                return Err(InvariantViolation::DuplicateSourceInMatch {
                    match_id: self.match_id.to_string(),
                    source_id: job.source.to_string(),
                });
            }
        }
        if seen.len() < 2 {
            return Err(InvariantViolation::SingleSourceMatch {
                match_id: self.match_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn job(source: &str, observed_at: i64, height: u64) -> Job {
        Job {
            source: SourceId::new(source),
            job_id: format!("{}-{}", source, observed_at),
            observed_at,
            height,
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

    fn group(primary: Job, others: Vec<Job>) -> Match {
        Match {
            match_id: MatchId::new(),
            key: primary.key(),
            primary_job: primary,
            matched_jobs: others.into_iter().map(|job| MatchedJob { job, score: 13 }).collect(),
            status: MatchStatus::Collecting,
            frozen_at: None,
        }
    }

    #[test]
    fn test_valid_match() {
        let m = group(job("a", 0, 1), vec![job("b", 150, 1)]);
        assert!(m.check_invariants().is_ok());
        assert_eq!(m.len(), 2);
        assert_eq!(m.spread_ms(), 150);
        assert_eq!(m.closes_at(300_000), 300_000);
    }

    #[test]
    fn test_single_source_match_rejected() {
        let m = group(job("a", 0, 1), Vec::new());
        assert!(matches!(
            m.check_invariants(),
            Err(InvariantViolation::SingleSourceMatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let m = group(job("a", 0, 1), vec![job("a", 10, 1)]);
        assert!(matches!(
            m.check_invariants(),
            Err(InvariantViolation::DuplicateSourceInMatch { .. })
        ));
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let m = group(job("a", 0, 1), vec![job("b", 10, 2)]);
        assert!(matches!(
            m.check_invariants(),
            Err(InvariantViolation::KeyMismatch { .. })
        ));
    }
}
