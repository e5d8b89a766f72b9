//! Propagation delay samples and their summary statistics

use serde::{Deserialize, Serialize};

use crate::ids::{MatchId, ServicePair, SourceId};

/// One measured delay between two sources for one match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationSample {
    pub match_id: MatchId,
    pub service_pair: ServicePair,
    /// Source that observed the job first (ties go to `service_pair.first()`).
    pub leader: SourceId,
    /// Later observation minus earlier observation, never negative.
    pub delta_ms: i64,
    /// `second.observed_at - first.observed_at` in canonical pair order.
    /// Positive means the pair's first source led.
    pub signed_delta_ms: i64,
    /// Later of the two observation times; drives bucket attribution.
    pub attributed_at: i64,
    /// Start of the bucket covering `attributed_at`.
    pub bucket_timestamp: i64,
}

/// Summary statistics over a set of delays.
///
/// An empty set yields the zeroed value rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairStats {
    pub sample_count: u64,
    pub mean: f64,
    pub median: f64,
    pub min: i64,
    pub max: i64,
    /// Population standard deviation.
    pub stddev: f64,
}

impl PairStats {
    pub fn empty() -> Self {
        Self {
            sample_count: 0,
            mean: 0.0,
            median: 0.0,
            min: 0,
            max: 0,
            stddev: 0.0,
        }
    }

    /// Exact statistics over the given delays.
    pub fn from_deltas(deltas: &[i64]) -> Self {
        if deltas.is_empty() {
            return Self::empty();
        }

        let mut sorted = deltas.to_vec();
        sorted.sort_unstable();

        let n = sorted.len();
        let mean = sorted.iter().map(|&d| d as f64).sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            sorted[n / 2] as f64
        } else {
            (sorted[n / 2 - 1] as f64 + sorted[n / 2] as f64) / 2.0
        };
        let variance = sorted
            .iter()
            .map(|&d| {
                let diff = d as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / n as f64;

        Self {
            sample_count: n as u64,
            mean,
            median,
            min: sorted[0],
            max: sorted[n - 1],
            stddev: variance.sqrt(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }
}

impl Default for PairStats {
    fn default() -> Self {
        Self::empty()
    }
}

/// Time-bucketed aggregate returned by history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryBucket {
    pub bucket_timestamp: i64,
    #[serde(flatten)]
    pub stats: PairStats,
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_stats_bounded_by_extremes(deltas in proptest::collection::vec(0i64..600_000, 1..200)) {
            let stats = PairStats::from_deltas(&deltas);
            prop_assert_eq!(stats.sample_count, deltas.len() as u64);
            prop_assert!(stats.min as f64 <= stats.median && stats.median <= stats.max as f64);
            prop_assert!(stats.min as f64 <= stats.mean + 1e-6 && stats.mean <= stats.max as f64 + 1e-6);
            prop_assert!(stats.stddev >= 0.0);
        }
    }
}
