//! Monitor configuration
//!
//! Everything tunable lives here: the per-source mapping table, matcher
//! window and weights, bucket widths, retention bounds and pipeline sizing.
//! Loaded once from JSON (every section optional) and validated eagerly;
//! any problem is a fatal [`ConfigurationError`].

use std::collections::BTreeMap;
use std::path::Path;

use monitor_types::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::normalizer::{CompiledMapping, FieldSpec, SourceMapping};

/// Per-field weights contributing to a similarity score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub version: u32,
    pub bits: u32,
    pub clean_jobs: u32,
    pub coinbase_tx: u32,
    pub merkle_branches: u32,
}

impl ScoreWeights {
    /// Highest attainable score, `None` if the weights overflow `u32`.
    pub fn total(&self) -> Option<u32> {
        [self.bits, self.clean_jobs, self.coinbase_tx, self.merkle_branches]
            .into_iter()
            .try_fold(self.version, u32::checked_add)
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            version: 1,
            bits: 1,
            clean_jobs: 1,
            coinbase_tx: 6,
            merkle_branches: 4,
        }
    }
}

/// Sliding-window matcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Maximum observation distance between matched jobs.
    pub window_ms: i64,
    /// Minimum score for two jobs to match.
    pub threshold: u32,
    pub weights: ScoreWeights,
    /// Compare only this many leading coinbase characters. `None` compares
    /// the whole transaction.
    pub coinbase_prefix_chars: Option<usize>,
    /// Oldest jobs are evicted from a key's buffer beyond this size.
    pub max_jobs_per_bucket: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            window_ms: 300_000,
            threshold: 10,
            weights: ScoreWeights::default(),
            coinbase_prefix_chars: None,
            max_jobs_per_bucket: 512,
        }
    }
}

/// Propagation analyzer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub bucket_width_ms: i64,
    pub default_lookback_ms: i64,
    /// Samples older than this (relative to the newest sample) are dropped.
    pub retention_ms: i64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            bucket_width_ms: 300_000,
            default_lookback_ms: 86_400_000,
            retention_ms: 86_400_000,
        }
    }
}

/// Aggregate store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Span of the rolling agreement-rate window.
    pub agreement_window_ms: i64,
    /// Granularity of the rolling agreement-rate window.
    pub agreement_bucket_ms: i64,
    /// Heights tracked before the oldest is evicted.
    pub max_heights: usize,
    /// A source silent for longer than this is reported degraded.
    pub source_stale_after_ms: i64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            agreement_window_ms: 3_600_000,
            agreement_bucket_ms: 60_000,
            max_heights: 2_048,
            source_stale_after_ms: 120_000,
        }
    }
}

/// Async pipeline sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Matcher shards; each key is owned by exactly one shard.
    pub shards: usize,
    pub channel_capacity: usize,
    /// Recent (source, job_id) identities remembered for dedup.
    pub dedup_window: usize,
    pub max_retained_jobs: usize,
    pub max_retained_matches: usize,
    /// Minimum watermark movement before shards are told to expire matches.
    pub advance_granularity_ms: i64,
    pub error_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            channel_capacity: 10_000,
            dedup_window: 100_000,
            max_retained_jobs: 50_000,
            max_retained_matches: 10_000,
            advance_granularity_ms: 1_000,
            error_channel_capacity: 1_024,
        }
    }
}

/// Complete monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub matcher: MatcherConfig,
    pub propagation: PropagationConfig,
    pub aggregates: AggregateConfig,
    pub pipeline: PipelineConfig,
    pub sources: BTreeMap<String, SourceMapping>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            propagation: PropagationConfig::default(),
            aggregates: AggregateConfig::default(),
            pipeline: PipelineConfig::default(),
            sources: default_sources(),
        }
    }
}

impl MonitorConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::Io(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json_str(&text)?;
        info!(path = %path.display(), sources = config.sources.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every tunable and compile every source mapping.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let m = &self.matcher;
        positive("matcher.window_ms", m.window_ms)?;
        if m.threshold == 0 {
            return Err(invalid("matcher.threshold", "must be at least 1"));
        }
        let total = m
            .weights
            .total()
            .ok_or_else(|| invalid("matcher.weights", "sum of weights overflows"))?;
        if m.threshold > total {
            return Err(invalid(
                "matcher.threshold",
                &format!("exceeds the maximum attainable score {}", total),
            ));
        }
        if m.coinbase_prefix_chars == Some(0) {
            return Err(invalid("matcher.coinbase_prefix_chars", "must be at least 1"));
        }
        non_zero("matcher.max_jobs_per_bucket", m.max_jobs_per_bucket)?;

        let p = &self.propagation;
        positive("propagation.bucket_width_ms", p.bucket_width_ms)?;
        positive("propagation.default_lookback_ms", p.default_lookback_ms)?;
        positive("propagation.retention_ms", p.retention_ms)?;

        let a = &self.aggregates;
        positive("aggregates.agreement_window_ms", a.agreement_window_ms)?;
        positive("aggregates.agreement_bucket_ms", a.agreement_bucket_ms)?;
        if a.agreement_bucket_ms > a.agreement_window_ms {
            return Err(invalid(
                "aggregates.agreement_bucket_ms",
                "must not exceed aggregates.agreement_window_ms",
            ));
        }
        non_zero("aggregates.max_heights", a.max_heights)?;
        positive("aggregates.source_stale_after_ms", a.source_stale_after_ms)?;

        let pl = &self.pipeline;
        non_zero("pipeline.shards", pl.shards)?;
        non_zero("pipeline.channel_capacity", pl.channel_capacity)?;
        non_zero("pipeline.dedup_window", pl.dedup_window)?;
        non_zero("pipeline.max_retained_jobs", pl.max_retained_jobs)?;
        non_zero("pipeline.max_retained_matches", pl.max_retained_matches)?;
        non_zero("pipeline.error_channel_capacity", pl.error_channel_capacity)?;
        if pl.advance_granularity_ms < 0 {
            return Err(invalid("pipeline.advance_granularity_ms", "must not be negative"));
        }

        if self.sources.is_empty() {
            return Err(ConfigurationError::NoSources);
        }
        for (source, mapping) in &self.sources {
            CompiledMapping::compile(source, mapping)?;
        }

        Ok(())
    }
}

fn invalid(setting: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::Invalid {
        setting: setting.to_string(),
        reason: reason.to_string(),
    }
}

fn positive(setting: &str, value: i64) -> Result<(), ConfigurationError> {
    if value <= 0 {
        return Err(invalid(setting, "must be positive"));
    }
    Ok(())
}

fn non_zero(setting: &str, value: usize) -> Result<(), ConfigurationError> {
    if value == 0 {
        return Err(invalid(setting, "must be at least 1"));
    }
    Ok(())
}

/// Built-in mappings for the three monitored services.
pub fn default_sources() -> BTreeMap<String, SourceMapping> {
    use monitor_types::job::JobField;

    let mut sources = BTreeMap::new();

    let mut observer = SourceMapping::mining_notify(
        FieldSpec::path("height"),
        FieldSpec::path("pool.name"),
        FieldSpec::path("pool.difficulty"),
    );
    observer.metadata.insert("pool_tag".to_string(), "pool.tag".to_string());
    sources.insert("miningpool.observer".to_string(), observer);

    let mut mempool = SourceMapping::mining_notify(
        FieldSpec::path("height"),
        FieldSpec::literal(json!("unknown")),
        FieldSpec::literal(json!(0)),
    );
    mempool.metadata.insert("pool_slug".to_string(), "poolSlug".to_string());
    sources.insert("mempool.space".to_string(), mempool);

    let mut work = BTreeMap::new();
    work.insert(JobField::JobId, FieldSpec::path("job.id"));
    work.insert(JobField::Height, FieldSpec::path("job.height"));
    work.insert(JobField::PrevBlockHash, FieldSpec::path("job.prevHash"));
    work.insert(JobField::Version, FieldSpec::path("job.version"));
    work.insert(JobField::Bits, FieldSpec::path("job.bits"));
    work.insert(JobField::Time, FieldSpec::path("job.time"));
    work.insert(JobField::Difficulty, FieldSpec::literal(json!(0)));
    work.insert(JobField::CleanJobs, FieldSpec::path("job.cleanJobs"));
    work.insert(JobField::MiningPool, FieldSpec::path("pool"));
    work.insert(
        JobField::CoinbaseTx,
        FieldSpec::concat(&["job.coinbase1", "job.coinbase2"]),
    );
    work.insert(JobField::MerkleBranches, FieldSpec::path("job.merkleBranches"));
    let mut work_meta = BTreeMap::new();
    work_meta.insert("server".to_string(), "server".to_string());
    sources.insert(
        "stratum.work".to_string(),
        SourceMapping {
            fields: work,
            metadata: work_meta,
        },
    );

    sources
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.matcher.window_ms, 300_000);
        assert_eq!(config.matcher.threshold, 10);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = MonitorConfig::from_json_str("{}").unwrap();
        assert_eq!(config, MonitorConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let config = MonitorConfig::from_json_str(
            r#"{ "matcher": { "window_ms": 60000 }, "pipeline": { "shards": 8 } }"#,
        )
        .unwrap();
        assert_eq!(config.matcher.window_ms, 60_000);
        assert_eq!(config.matcher.threshold, 10);
        assert_eq!(config.pipeline.shards, 8);
    }

    #[test]
    fn test_mapping_table_from_json() {
        let text = r#"{
            "sources": {
                "custom.feed": {
                    "fields": {
                        "job_id": { "path": "id" },
                        "height": { "path": "h" },
                        "prev_block_hash": { "path": "prev" },
                        "version": { "path": "v" },
                        "bits": { "path": "nbits" },
                        "time": { "path": "ntime", "encoding": "hex" },
                        "difficulty": { "literal": 0 },
                        "clean_jobs": { "literal": false },
                        "mining_pool": { "literal": "unknown" },
                        "coinbase_tx": { "concat": ["cb1", "cb2"] },
                        "merkle_branches": { "path": "branches" }
                    }
                }
            }
        }"#;
        let config = MonitorConfig::from_json_str(text).unwrap();
        assert_eq!(config.sources.len(), 1);
        assert!(config.sources.contains_key("custom.feed"));
    }

    #[test]
    fn test_unreachable_threshold_rejected() {
        let mut config = MonitorConfig::default();
        config.matcher.threshold = config.matcher.weights.total().unwrap() + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
    }

    #[test]
    fn test_overflowing_weights_rejected() {
        let mut config = MonitorConfig::default();
        config.matcher.weights.coinbase_tx = u32::MAX;
        config.matcher.weights.merkle_branches = u32::MAX;
        assert_eq!(config.matcher.weights.total(), None);
        match config.validate() {
            Err(ConfigurationError::Invalid { setting, .. }) => assert_eq!(setting, "matcher.weights"),
            other => panic!("expected invalid weights, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = MonitorConfig::default();
        config.matcher.window_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_sources_rejected() {
        let mut config = MonitorConfig::default();
        config.sources.clear();
        assert_eq!(config.validate(), Err(ConfigurationError::NoSources));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            MonitorConfig::from_json_str("{ not json"),
            Err(ConfigurationError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_field_key_rejected() {
        let text = r#"{ "sources": { "x": { "fields": { "nonce": { "path": "n" } } } } }"#;
        assert!(matches!(
            MonitorConfig::from_json_str(text),
            Err(ConfigurationError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            MonitorConfig::from_file("/nonexistent/monitor.json"),
            Err(ConfigurationError::Io(_))
        ));
    }
}
