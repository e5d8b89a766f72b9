//! Job Correlator Service
//!
//! Consumes `mining.notify` observations reported by independent monitoring
//! services and produces:
//! - Normalized jobs in one unified schema, from per-source mapping tables
//! - Match groups of jobs that denote the same upstream job
//! - Per service pair propagation delay statistics, bucketed in time
//! - Rolling aggregates per pool, height and source
//!
//! # Architecture
//!
//! ```text
//!  Raw payloads (per source)
//!        │
//!   ┌────▼──────┐
//!   │Normalizer │  ← Table-driven path / concat / literal mapping
//!   └────┬──────┘
//!        │ Job
//!   ┌────▼──────┐
//!   │ Ingest    │  ← Dedup on (source, job_id), event-time watermark
//!   └────┬──────┘
//!        │
//!   ┌────▼──────┐        ┌───────────┐
//!   │ Matcher   │───────►│ Aggregates│ ← Jobs and frozen matches
//!   └────┬──────┘        └─────▲─────┘
//!        │ frozen Match        │
//!   ┌────▼──────────┐          │
//!   │ Propagation   │──────────┘
//!   └────┬──────────┘
//!        │
//!   ┌────▼──────┐
//!   │  Query    │  ← Read-only snapshots
//!   └───────────┘
//! ```
//!
//! [`engine::CorrelationEngine`] runs the chain synchronously;
//! [`pipeline::Pipeline`] runs it on tokio with matcher shards keyed by
//! `(height, prev_block_hash)`.

pub mod aggregates;
pub mod config;
pub mod engine;
pub mod ingestion;
pub mod matcher;
pub mod metrics;
pub mod normalizer;
pub mod pipeline;
pub mod propagation;
pub mod query;
pub mod store;

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
