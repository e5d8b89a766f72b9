//! Normalized job observations
//!
//! A [`Job`] is one observation of a `mining.notify` announcement by one
//! monitoring source, after its source-native payload has been mapped onto
//! the unified field set. Jobs are immutable once produced.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{JobKey, SourceId};

/// Latest accepted `observed_at`. Leaves headroom so window and bucket
/// arithmetic on any two accepted timestamps cannot overflow.
pub const MAX_OBSERVED_AT_MS: i64 = i64::MAX / 4;

/// Metadata key holding the region the collecting client runs in.
pub const SOURCE_REGION_KEY: &str = "source_region";

/// Metadata key holding the region where the monitored service was reached.
pub const TARGET_REGION_KEY: &str = "target_region";

/// Metadata keys written by the pipeline itself.
pub const RESERVED_METADATA_KEYS: [&str; 2] = [SOURCE_REGION_KEY, TARGET_REGION_KEY];

/// One observation of a mining job by one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Observing service.
    pub source: SourceId,
    /// Source-local job identifier (not globally unique).
    pub job_id: String,
    /// Unix milliseconds when the observation was received and normalized.
    pub observed_at: i64,
    pub height: u64,
    pub prev_block_hash: String,
    /// Block version as normalized lowercase hex.
    pub version: String,
    /// Compact difficulty target as normalized lowercase hex.
    pub bits: String,
    /// Block header time (`ntime`).
    pub time: u64,
    pub difficulty: Decimal,
    pub clean_jobs: bool,
    pub mining_pool: String,
    /// Coinbase transaction (head and tail joined when the source splits it).
    pub coinbase_tx: String,
    pub merkle_branches: Vec<String>,
    /// Source-specific fields, preserved opaquely and never used for matching.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Job {
    /// Correlation key of this job.
    pub fn key(&self) -> JobKey {
        JobKey::new(self.height, self.prev_block_hash.clone())
    }

    /// Identity used for duplicate detection.
    pub fn identity(&self) -> (SourceId, String) {
        (self.source.clone(), self.job_id.clone())
    }

    /// Whether `observed_at` lies in `0..=MAX_OBSERVED_AT_MS`.
    pub fn has_valid_observed_at(&self) -> bool {
        (0..=MAX_OBSERVED_AT_MS).contains(&self.observed_at)
    }

    pub fn source_region(&self) -> Option<&str> {
        self.metadata.get(SOURCE_REGION_KEY).and_then(|v| v.as_str())
    }

    pub fn target_region(&self) -> Option<&str> {
        self.metadata.get(TARGET_REGION_KEY).and_then(|v| v.as_str())
    }

    /// Wall-clock rendering of `observed_at` for display.
    pub fn observed_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.observed_at)
    }
}

/// Value kinds a unified field may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Bool,
    TextList,
}

/// The unified job fields a source mapping must populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobField {
    JobId,
    Height,
    PrevBlockHash,
    Version,
    Bits,
    Time,
    Difficulty,
    CleanJobs,
    MiningPool,
    CoinbaseTx,
    MerkleBranches,
}

impl JobField {
    /// Every unified field, in declaration order.
    pub const ALL: [JobField; 11] = [
        JobField::JobId,
        JobField::Height,
        JobField::PrevBlockHash,
        JobField::Version,
        JobField::Bits,
        JobField::Time,
        JobField::Difficulty,
        JobField::CleanJobs,
        JobField::MiningPool,
        JobField::CoinbaseTx,
        JobField::MerkleBranches,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobField::JobId => "job_id",
            JobField::Height => "height",
            JobField::PrevBlockHash => "prev_block_hash",
            JobField::Version => "version",
            JobField::Bits => "bits",
            JobField::Time => "time",
            JobField::Difficulty => "difficulty",
            JobField::CleanJobs => "clean_jobs",
            JobField::MiningPool => "mining_pool",
            JobField::CoinbaseTx => "coinbase_tx",
            JobField::MerkleBranches => "merkle_branches",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            JobField::Height | JobField::Time => FieldKind::Integer,
            JobField::Difficulty => FieldKind::Decimal,
            JobField::CleanJobs => FieldKind::Bool,
            JobField::MerkleBranches => FieldKind::TextList,
            JobField::JobId
            | JobField::PrevBlockHash
            | JobField::Version
            | JobField::Bits
            | JobField::MiningPool
            | JobField::CoinbaseTx => FieldKind::Text,
        }
    }

    /// Fields that identify the job and must come from the payload itself.
    pub fn requires_payload(&self) -> bool {
        matches!(
            self,
            JobField::JobId | JobField::Height | JobField::PrevBlockHash
        )
    }
}

impl fmt::Display for JobField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            source: SourceId::new("miningpool.observer"),
            job_id: "j1".to_string(),
            observed_at: 1_708_123_456_789,
            height: 800_000,
            prev_block_hash: "00aa".to_string(),
            version: "20000000".to_string(),
            bits: "17034219".to_string(),
            time: 1_708_123_450,
            difficulty: Decimal::from(1),
            clean_jobs: true,
            mining_pool: "Foundry USA".to_string(),
            coinbase_tx: "01000000".to_string(),
            merkle_branches: vec!["ab".to_string()],
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_job_key() {
        let job = sample_job();
        assert_eq!(job.key(), JobKey::new(800_000, "00aa"));
    }

    #[test]
    fn test_observed_at_utc() {
        let job = sample_job();
        let utc = job.observed_at_utc().unwrap();
        assert_eq!(utc.timestamp_millis(), 1_708_123_456_789);
    }

    #[test]
    fn test_observed_at_range() {
        let mut job = sample_job();
        assert!(job.has_valid_observed_at());
        job.observed_at = -1;
        assert!(!job.has_valid_observed_at());
        job.observed_at = MAX_OBSERVED_AT_MS + 1;
        assert!(!job.has_valid_observed_at());
    }

    #[test]
    fn test_region_accessors() {
        let mut job = sample_job();
        assert_eq!(job.target_region(), None);
        job.metadata
            .insert(TARGET_REGION_KEY.to_string(), serde_json::Value::from("eu"));
        job.metadata
            .insert(SOURCE_REGION_KEY.to_string(), serde_json::Value::from("us"));
        assert_eq!(job.target_region(), Some("eu"));
        assert_eq!(job.source_region(), Some("us"));
    }

    #[test]
    fn test_field_kinds() {
        assert_eq!(JobField::Height.kind(), FieldKind::Integer);
        assert_eq!(JobField::MerkleBranches.kind(), FieldKind::TextList);
        assert_eq!(JobField::CleanJobs.kind(), FieldKind::Bool);
        assert!(JobField::PrevBlockHash.requires_payload());
        assert!(!JobField::MiningPool.requires_payload());
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let job = sample_job();
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }
}
