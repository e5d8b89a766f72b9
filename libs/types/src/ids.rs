//! Identifier types for monitored sources, matches and correlation keys
//!
//! Source identifiers are the canonical service names (e.g.
//! `miningpool.observer`). Match identifiers use UUID v7 so matches list in
//! creation order.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of an observing service
///
/// Compared and ordered lexicographically; the ordering is what makes
/// [`ServicePair`] canonical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for a match group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(Uuid);

impl MatchId {
    /// Create a new MatchId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation key: jobs can only match within the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub height: u64,
    pub prev_block_hash: String,
}

impl JobKey {
    pub fn new(height: u64, prev_block_hash: impl Into<String>) -> Self {
        Self {
            height,
            prev_block_hash: prev_block_hash.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.prev_block_hash)
    }
}

/// Unordered pair of sources, stored with `first < second`.
///
/// Serialized and displayed as `first|second`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServicePair {
    first: SourceId,
    second: SourceId,
}

impl ServicePair {
    /// Separator used by [`ServicePair::key`] and [`ServicePair::parse`].
    pub const SEPARATOR: char = '|';

    /// Build a canonical pair. Returns `None` when both sides are the same
    /// source (a source is never paired with itself).
    pub fn new(a: SourceId, b: SourceId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { first: a, second: b }),
            std::cmp::Ordering::Greater => Some(Self { first: b, second: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Parse a `a|b` key in either order.
    pub fn parse(key: &str) -> Option<Self> {
        let (a, b) = key.split_once(Self::SEPARATOR)?;
        let (a, b) = (a.trim(), b.trim());
        if a.is_empty() || b.is_empty() {
            return None;
        }
        Self::new(SourceId::from(a), SourceId::from(b))
    }

    pub fn first(&self) -> &SourceId {
        &self.first
    }

    pub fn second(&self) -> &SourceId {
        &self.second
    }

    pub fn contains(&self, source: &SourceId) -> bool {
        &self.first == source || &self.second == source
    }

    pub fn key(&self) -> String {
        format!("{}{}{}", self.first, Self::SEPARATOR, self.second)
    }
}

impl fmt::Display for ServicePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.first, Self::SEPARATOR, self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_pair_is_canonical() {
        let ab = ServicePair::new("stratum.work".into(), "miningpool.observer".into()).unwrap();
        let ba = ServicePair::new("miningpool.observer".into(), "stratum.work".into()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.first().as_str(), "miningpool.observer");
        assert_eq!(ab.key(), "miningpool.observer|stratum.work");
    }

    #[test]
    fn test_service_pair_rejects_self_pair() {
        assert!(ServicePair::new("mempool.space".into(), "mempool.space".into()).is_none());
    }

    #[test]
    fn test_service_pair_parse() {
        let pair = ServicePair::parse("stratum.work|mempool.space").unwrap();
        assert_eq!(pair.key(), "mempool.space|stratum.work");
        assert!(pair.contains(&"stratum.work".into()));

        assert!(ServicePair::parse("stratum.work").is_none());
        assert!(ServicePair::parse("|mempool.space").is_none());
    }

    #[test]
    fn test_match_id_uniqueness() {
        let a = MatchId::new();
        let b = MatchId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_job_key_display() {
        let key = JobKey::new(800_000, "00ab");
        assert_eq!(key.to_string(), "800000@00ab");
    }
}
