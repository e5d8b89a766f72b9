//! Bounded retention of accepted jobs and of matches
//!
//! The query layer reads from here. Both stores keep a fixed number of the
//! most recent entries and hand out clones, never references.

use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use monitor_types::correlation::Match;
use monitor_types::ids::MatchId;
use monitor_types::job::Job;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Most recent accepted jobs, oldest first.
pub struct JobLog {
    jobs: RwLock<VecDeque<Job>>,
    capacity: usize,
}

impl JobLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: RwLock::new(VecDeque::with_capacity(capacity.min(4_096))),
            capacity,
        }
    }

    pub fn push(&self, job: Job) {
        let mut jobs = write(&self.jobs);
        if jobs.len() >= self.capacity {
            jobs.pop_front();
        }
        jobs.push_back(job);
    }

    /// Matching jobs, newest first, after skipping `skip` of them.
    pub fn collect_newest(&self, filter: impl Fn(&Job) -> bool, skip: usize, take: usize) -> Vec<Job> {
        read(&self.jobs)
            .iter()
            .rev()
            .filter(|j| filter(*j))
            .skip(skip)
            .take(take)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.jobs).is_empty()
    }
}

/// Open matches by id plus a bounded log of frozen ones.
pub struct MatchRegistry {
    open: DashMap<MatchId, Match>,
    frozen: RwLock<VecDeque<Match>>,
    capacity: usize,
}

impl MatchRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            open: DashMap::new(),
            frozen: RwLock::new(VecDeque::with_capacity(capacity.min(4_096))),
            capacity,
        }
    }

    /// Insert or replace the current state of an open match.
    pub fn upsert_open(&self, m: Match) {
        self.open.insert(m.match_id, m);
    }

    /// Move a match to the frozen log.
    pub fn freeze(&self, m: Match) {
        self.open.remove(&m.match_id);
        let mut frozen = write(&self.frozen);
        if frozen.len() >= self.capacity {
            frozen.pop_front();
        }
        frozen.push_back(m);
    }

    /// Forget an open match without recording it.
    pub fn discard(&self, id: &MatchId) {
        self.open.remove(id);
    }

    pub fn get(&self, id: &MatchId) -> Option<Match> {
        if let Some(m) = self.open.get(id) {
            return Some(m.value().clone());
        }
        read(&self.frozen).iter().find(|m| &m.match_id == id).cloned()
    }

    /// Open matches then frozen ones, each newest first.
    pub fn collect_newest(&self, filter: impl Fn(&Match) -> bool) -> Vec<Match> {
        let mut open: Vec<Match> = self
            .open
            .iter()
            .filter(|e| filter(e.value()))
            .map(|e| e.value().clone())
            .collect();
        open.sort_by(|a, b| {
            (b.primary_job.observed_at, b.match_id).cmp(&(a.primary_job.observed_at, a.match_id))
        });

        let frozen = read(&self.frozen);
        open.extend(frozen.iter().rev().filter(|m| filter(*m)).cloned());
        open
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn frozen_count(&self) -> usize {
        read(&self.frozen).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monitor_types::correlation::{MatchStatus, MatchedJob};
    use monitor_types::ids::SourceId;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn job(source: &str, observed_at: i64) -> Job {
        Job {
            source: SourceId::new(source),
            job_id: format!("{}-{}", source, observed_at),
            observed_at,
            height: 1,
            prev_block_hash: "00aa".to_string(),
            version: "20000000".to_string(),
            bits: "17034219".to_string(),
            time: 0,
            difficulty: Decimal::ZERO,
            clean_jobs: true,
            mining_pool: "p".to_string(),
            coinbase_tx: "cb".to_string(),
            merkle_branches: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    fn open_match(t: i64) -> Match {
        let primary = job("a", t);
        Match {
            match_id: MatchId::new(),
            key: primary.key(),
            primary_job: primary,
            matched_jobs: vec![MatchedJob {
                job: job("b", t + 1),
                score: 13,
            }],
            status: MatchStatus::Collecting,
            frozen_at: None,
        }
    }

    #[test]
    fn test_job_log_is_bounded() {
        let log = JobLog::new(2);
        log.push(job("a", 1));
        log.push(job("a", 2));
        log.push(job("a", 3));

        let newest = log.collect_newest(|_| true, 0, 10);
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].observed_at, 3);
        assert_eq!(newest[1].observed_at, 2);
    }

    #[test]
    fn test_job_log_paging() {
        let log = JobLog::new(10);
        for t in 0..5 {
            log.push(job("a", t));
        }
        let page = log.collect_newest(|_| true, 2, 2);
        assert_eq!(page.iter().map(|j| j.observed_at).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_match_registry_lifecycle() {
        let registry = MatchRegistry::new(10);
        let mut m = open_match(0);
        registry.upsert_open(m.clone());
        assert_eq!(registry.open_count(), 1);

        m.status = MatchStatus::Frozen;
        registry.freeze(m.clone());
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.frozen_count(), 1);
        assert!(registry.get(&m.match_id).unwrap().is_frozen());
    }

    #[test]
    fn test_collect_open_before_frozen() {
        let registry = MatchRegistry::new(10);
        let old = open_match(0);
        registry.freeze(old.clone());
        let newer = open_match(100);
        registry.upsert_open(newer.clone());

        let all = registry.collect_newest(|_| true);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].match_id, newer.match_id);
        assert_eq!(all[1].match_id, old.match_id);
    }
}
