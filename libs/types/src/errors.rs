//! Error types for the job propagation monitor
//!
//! Comprehensive error taxonomy using thiserror

use thiserror::Error;

/// Top-level monitor error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MonitorError {
    #[error("Schema mapping error: {0}")]
    Mapping(#[from] SchemaMappingError),

    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Pipeline is closed")]
    PipelineClosed,
}

/// A raw payload could not be mapped onto the unified job schema.
///
/// Rejects the single event; never halts the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{source_id}: field `{field}`: {kind}")]
pub struct SchemaMappingError {
    pub source_id: String,
    pub field: String,
    pub kind: MappingFailure,
}

impl SchemaMappingError {
    pub fn new(source_id: impl Into<String>, field: impl Into<String>, kind: MappingFailure) -> Self {
        Self {
            source_id: source_id.into(),
            field: field.into(),
            kind,
        }
    }

    pub fn unknown_source(source_id: impl Into<String>) -> Self {
        Self::new(source_id, "*", MappingFailure::UnknownSource)
    }
}

/// Why a field could not be mapped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingFailure {
    #[error("no mapping registered for source")]
    UnknownSource,

    #[error("path `{path}` not present in payload")]
    MissingPath { path: String },

    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Internal matcher/analyzer contract breach. Logged; the event is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("match {match_id} has a single distinct source")]
    SingleSourceMatch { match_id: String },

    #[error("match {match_id} contains source {source_id} more than once")]
    DuplicateSourceInMatch { match_id: String, source_id: String },

    #[error("match {match_id} contains a job from {source_id} with a different key")]
    KeyMismatch { match_id: String, source_id: String },
}

/// Invalid mapping table or tunables. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid setting `{setting}`: {reason}")]
    Invalid { setting: String, reason: String },

    #[error("source `{source_id}` does not map field `{field}`")]
    MissingField { source_id: String, field: String },

    #[error("source `{source_id}` field `{field}`: bad path `{path}`: {reason}")]
    BadPath {
        source_id: String,
        field: String,
        path: String,
        reason: String,
    },

    #[error("no sources configured")]
    NoSources,

    #[error("cannot read configuration: {0}")]
    Io(String),

    #[error("cannot parse configuration: {0}")]
    Parse(String),
}
