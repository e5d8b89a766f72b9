//! Schema normalizer
//!
//! Maps source-native payloads onto the unified [`Job`] schema. Each source
//! is described by a declarative table of [`FieldSpec`]s which is compiled
//! once at startup into a [`CompiledMapping`]: a small interpreter over a
//! closed set of operators (path extraction, concatenation, literal).
//!
//! Nothing is guessed: numeric fields accept numbers (or hex strings when the
//! mapping declares `encoding: "hex"`), booleans accept booleans, text
//! accepts strings. Any other shape is a [`SchemaMappingError`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use monitor_types::errors::{ConfigurationError, MappingFailure, SchemaMappingError};
use monitor_types::ids::SourceId;
use monitor_types::job::{
    FieldKind, Job, JobField, MAX_OBSERVED_AT_MS, RESERVED_METADATA_KEYS, SOURCE_REGION_KEY, TARGET_REGION_KEY,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

// ── Field paths ─────────────────────────────────────────────────────

/// One step of a field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed field path such as `params[4]` or `job.prevHash`.
///
/// Dotted segments address object keys; `[n]` or an all-digit segment
/// addresses an array position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    raw: String,
    segments: Vec<PathSegment>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("empty path".to_string());
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            if part.is_empty() {
                return Err("empty path segment".to_string());
            }

            let (name, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if !name.is_empty() {
                if name.bytes().all(|b| b.is_ascii_digit()) {
                    let index = name.parse::<usize>().map_err(|e| e.to_string())?;
                    segments.push(PathSegment::Index(index));
                } else {
                    segments.push(PathSegment::Key(name.to_string()));
                }
            }

            while !rest.is_empty() {
                let close = rest
                    .find(']')
                    .ok_or_else(|| format!("unclosed index in `{}`", part))?;
                if !rest.starts_with('[') {
                    return Err(format!("unexpected characters in `{}`", part));
                }
                let index = rest[1..close]
                    .parse::<usize>()
                    .map_err(|_| format!("invalid index in `{}`", part))?;
                segments.push(PathSegment::Index(index));
                rest = &rest[close + 1..];
            }
        }

        Ok(Self {
            raw: trimmed.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Resolve the path against a payload. `None` when any step is absent.
    pub fn resolve<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        let mut current = payload;
        for segment in &self.segments {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
                _ => return None,
            };
        }
        match current {
            Value::Null => None,
            other => Some(other),
        }
    }
}

// ── Declarative mapping table ───────────────────────────────────────

/// How a numeric field is encoded in the source payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// JSON number or decimal string.
    #[default]
    Plain,
    /// Hex string, optionally `0x`-prefixed.
    Hex,
}

/// Declarative definition of one unified field for one source.
///
/// Exactly one of `path`, `concat` or `literal` must be set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldSpec {
    pub path: Option<String>,
    pub concat: Option<Vec<String>>,
    pub literal: Option<Value>,
    pub encoding: Encoding,
}

impl FieldSpec {
    pub fn path(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            ..Self::default()
        }
    }

    pub fn hex(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            encoding: Encoding::Hex,
            ..Self::default()
        }
    }

    pub fn concat(paths: &[&str]) -> Self {
        Self {
            concat: Some(paths.iter().map(|p| p.to_string()).collect()),
            ..Self::default()
        }
    }

    pub fn literal(value: Value) -> Self {
        Self {
            literal: Some(value),
            ..Self::default()
        }
    }
}

/// Mapping table entry for one source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceMapping {
    /// Unified field → how to obtain it.
    pub fields: BTreeMap<JobField, FieldSpec>,
    /// Metadata key → payload path, copied opaquely when present.
    pub metadata: BTreeMap<String, String>,
}

impl SourceMapping {
    /// Standard `mining.notify` positional parameters, with height, pool
    /// and difficulty supplied by the caller.
    pub fn mining_notify(height: FieldSpec, mining_pool: FieldSpec, difficulty: FieldSpec) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(JobField::JobId, FieldSpec::path("params[0]"));
        fields.insert(JobField::PrevBlockHash, FieldSpec::path("params[1]"));
        fields.insert(JobField::CoinbaseTx, FieldSpec::concat(&["params[2]", "params[3]"]));
        fields.insert(JobField::MerkleBranches, FieldSpec::path("params[4]"));
        fields.insert(JobField::Version, FieldSpec::path("params[5]"));
        fields.insert(JobField::Bits, FieldSpec::path("params[6]"));
        fields.insert(JobField::Time, FieldSpec::hex("params[7]"));
        fields.insert(JobField::CleanJobs, FieldSpec::path("params[8]"));
        fields.insert(JobField::Height, height);
        fields.insert(JobField::MiningPool, mining_pool);
        fields.insert(JobField::Difficulty, difficulty);
        Self {
            fields,
            metadata: BTreeMap::new(),
        }
    }
}

// ── Compiled form ───────────────────────────────────────────────────

/// A typed unified field value.
#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Text(String),
    Integer(u64),
    Decimal(Decimal),
    Bool(bool),
    TextList(Vec<String>),
}

#[derive(Debug, Clone)]
enum FieldOp {
    Path(FieldPath),
    Concat(Vec<FieldPath>),
    Literal(FieldValue),
}

#[derive(Debug, Clone)]
struct FieldRule {
    field: JobField,
    op: FieldOp,
    encoding: Encoding,
}

/// Validated, ready-to-run mapping for one source.
#[derive(Debug, Clone)]
pub struct CompiledMapping {
    source: SourceId,
    rules: Vec<FieldRule>,
    metadata: Vec<(String, FieldPath)>,
}

impl CompiledMapping {
    /// Compile and validate a declarative mapping.
    pub fn compile(source: &str, mapping: &SourceMapping) -> Result<Self, ConfigurationError> {
        let mut rules = Vec::with_capacity(JobField::ALL.len());

        for field in JobField::ALL {
            let spec = mapping
                .fields
                .get(&field)
                .ok_or_else(|| ConfigurationError::MissingField {
                    source_id: source.to_string(),
                    field: field.to_string(),
                })?;
            rules.push(compile_rule(source, field, spec)?);
        }

        let mut metadata = Vec::with_capacity(mapping.metadata.len());
        for (name, raw) in &mapping.metadata {
            if RESERVED_METADATA_KEYS.contains(&name.as_str()) {
                return Err(ConfigurationError::Invalid {
                    setting: format!("sources.{}.metadata.{}", source, name),
                    reason: "name is reserved for the delivery region".to_string(),
                });
            }
            let path = FieldPath::parse(raw).map_err(|reason| ConfigurationError::BadPath {
                source_id: source.to_string(),
                field: format!("metadata.{}", name),
                path: raw.clone(),
                reason,
            })?;
            metadata.push((name.clone(), path));
        }

        Ok(Self {
            source: SourceId::new(source),
            rules,
            metadata,
        })
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    /// Run the mapping. Pure function of (mapping, payload, observed_at).
    pub fn apply(&self, payload: &Value, observed_at: i64) -> Result<Job, SchemaMappingError> {
        let mut values: BTreeMap<JobField, FieldValue> = BTreeMap::new();
        for rule in &self.rules {
            let value = self.evaluate(rule, payload)?;
            values.insert(rule.field, value);
        }

        let mut metadata = BTreeMap::new();
        for (name, path) in &self.metadata {
            if let Some(value) = path.resolve(payload) {
                metadata.insert(name.clone(), value.clone());
            }
        }

        let job = Job {
            source: self.source.clone(),
            job_id: take_text(&mut values, JobField::JobId),
            observed_at,
            height: take_integer(&mut values, JobField::Height),
            prev_block_hash: take_text(&mut values, JobField::PrevBlockHash),
            version: take_text(&mut values, JobField::Version),
            bits: take_text(&mut values, JobField::Bits),
            time: take_integer(&mut values, JobField::Time),
            difficulty: match values.remove(&JobField::Difficulty) {
                Some(FieldValue::Decimal(d)) => d,
                _ => Decimal::ZERO,
            },
            clean_jobs: matches!(values.remove(&JobField::CleanJobs), Some(FieldValue::Bool(true))),
            mining_pool: take_text(&mut values, JobField::MiningPool),
            coinbase_tx: take_text(&mut values, JobField::CoinbaseTx),
            merkle_branches: match values.remove(&JobField::MerkleBranches) {
                Some(FieldValue::TextList(list)) => list,
                _ => Vec::new(),
            },
            metadata,
        };

        if job.job_id.is_empty() {
            return Err(self.error(JobField::JobId, MappingFailure::InvalidValue("empty job id".to_string())));
        }
        if job.prev_block_hash.is_empty() {
            return Err(self.error(
                JobField::PrevBlockHash,
                MappingFailure::InvalidValue("empty previous block hash".to_string()),
            ));
        }

        Ok(job)
    }

    fn evaluate(&self, rule: &FieldRule, payload: &Value) -> Result<FieldValue, SchemaMappingError> {
        match &rule.op {
            FieldOp::Literal(value) => Ok(value.clone()),
            FieldOp::Path(path) => {
                let raw = path.resolve(payload).ok_or_else(|| {
                    self.error(
                        rule.field,
                        MappingFailure::MissingPath {
                            path: path.as_str().to_string(),
                        },
                    )
                })?;
                convert(rule.field, raw, rule.encoding).map_err(|kind| self.error(rule.field, kind))
            }
            FieldOp::Concat(parts) => {
                let mut joined = String::new();
                for path in parts {
                    let raw = path.resolve(payload).ok_or_else(|| {
                        self.error(
                            rule.field,
                            MappingFailure::MissingPath {
                                path: path.as_str().to_string(),
                            },
                        )
                    })?;
                    match raw {
                        Value::String(s) => joined.push_str(s),
                        other => {
                            return Err(self.error(
                                rule.field,
                                MappingFailure::TypeMismatch {
                                    expected: "string".to_string(),
                                    found: json_type(other).to_string(),
                                },
                            ))
                        }
                    }
                }
                convert(rule.field, &Value::String(joined), rule.encoding)
                    .map_err(|kind| self.error(rule.field, kind))
            }
        }
    }

    fn error(&self, field: JobField, kind: MappingFailure) -> SchemaMappingError {
        SchemaMappingError::new(self.source.as_str(), field.as_str(), kind)
    }
}

fn compile_rule(source: &str, field: JobField, spec: &FieldSpec) -> Result<FieldRule, ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::Invalid {
        setting: format!("sources.{}.fields.{}", source, field),
        reason: reason.to_string(),
    };
    let bad_path = |path: &str, reason: String| ConfigurationError::BadPath {
        source_id: source.to_string(),
        field: field.to_string(),
        path: path.to_string(),
        reason,
    };

    let set = [spec.path.is_some(), spec.concat.is_some(), spec.literal.is_some()]
        .iter()
        .filter(|&&b| b)
        .count();
    if set != 1 {
        return Err(invalid("exactly one of `path`, `concat` or `literal` must be set"));
    }

    if spec.encoding == Encoding::Hex && field.kind() != FieldKind::Integer {
        return Err(invalid("hex encoding only applies to integer fields"));
    }

    let op = if let Some(raw) = &spec.path {
        FieldOp::Path(FieldPath::parse(raw).map_err(|reason| bad_path(raw, reason))?)
    } else if let Some(parts) = &spec.concat {
        if field.kind() != FieldKind::Text {
            return Err(invalid("concat only applies to text fields"));
        }
        if parts.len() < 2 {
            return Err(invalid("concat needs at least two paths"));
        }
        let mut paths = Vec::with_capacity(parts.len());
        for raw in parts {
            paths.push(FieldPath::parse(raw).map_err(|reason| bad_path(raw, reason))?);
        }
        FieldOp::Concat(paths)
    } else {
        if field.requires_payload() {
            return Err(invalid("identifying fields cannot be literals"));
        }
        let literal = spec.literal.as_ref().unwrap_or(&Value::Null);
        let value = convert(field, literal, spec.encoding)
            .map_err(|kind| invalid(&format!("literal does not fit the field: {}", kind)))?;
        FieldOp::Literal(value)
    };

    Ok(FieldRule {
        field,
        op,
        encoding: spec.encoding,
    })
}

fn convert(field: JobField, raw: &Value, encoding: Encoding) -> Result<FieldValue, MappingFailure> {
    let mismatch = |expected: &str| MappingFailure::TypeMismatch {
        expected: expected.to_string(),
        found: json_type(raw).to_string(),
    };

    match field.kind() {
        FieldKind::Text => match raw {
            Value::String(s) => Ok(FieldValue::Text(normalize_text(field, s))),
            _ => Err(mismatch("string")),
        },
        FieldKind::Integer => match (encoding, raw) {
            (Encoding::Plain, Value::Number(n)) => n
                .as_u64()
                .map(FieldValue::Integer)
                .ok_or_else(|| MappingFailure::InvalidValue(format!("{} is not a non-negative integer", n))),
            (Encoding::Plain, Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map(FieldValue::Integer)
                .map_err(|_| MappingFailure::InvalidValue(format!("`{}` is not a decimal integer", s))),
            (Encoding::Hex, Value::String(s)) => u64::from_str_radix(strip_hex_prefix(s.trim()), 16)
                .map(FieldValue::Integer)
                .map_err(|_| MappingFailure::InvalidValue(format!("`{}` is not a hex integer", s))),
            (Encoding::Plain, _) => Err(mismatch("integer")),
            (Encoding::Hex, _) => Err(mismatch("hex string")),
        },
        FieldKind::Decimal => {
            let text = match raw {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.trim().to_string(),
                _ => return Err(mismatch("number")),
            };
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .map(FieldValue::Decimal)
                .map_err(|_| MappingFailure::InvalidValue(format!("`{}` is not a decimal", text)))
        }
        FieldKind::Bool => match raw {
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            _ => Err(mismatch("boolean")),
        },
        FieldKind::TextList => match raw {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(normalize_hex(s)),
                    other => Err(MappingFailure::TypeMismatch {
                        expected: "string list".to_string(),
                        found: format!("list containing {}", json_type(other)),
                    }),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::TextList),
            _ => Err(mismatch("array")),
        },
    }
}

fn normalize_text(field: JobField, s: &str) -> String {
    match field {
        JobField::PrevBlockHash | JobField::Version | JobField::Bits | JobField::CoinbaseTx => normalize_hex(s),
        _ => s.trim().to_string(),
    }
}

fn normalize_hex(s: &str) -> String {
    strip_hex_prefix(s.trim()).to_ascii_lowercase()
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn take_text(values: &mut BTreeMap<JobField, FieldValue>, field: JobField) -> String {
    match values.remove(&field) {
        Some(FieldValue::Text(s)) => s,
        _ => String::new(),
    }
}

fn take_integer(values: &mut BTreeMap<JobField, FieldValue>, field: JobField) -> u64 {
    match values.remove(&field) {
        Some(FieldValue::Integer(n)) => n,
        _ => 0,
    }
}

// ── Normalizer ──────────────────────────────────────────────────────

/// Wall-clock source for stamping `observed_at`.
pub trait Clock: Send + Sync {
    /// Current Unix time in milliseconds.
    fn now_ms(&self) -> i64;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Where an event was collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventRegion {
    /// Region the collecting client runs in.
    pub source: Option<String>,
    /// Region where the monitored service was reached.
    pub target: Option<String>,
}

impl EventRegion {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            target: Some(target.into()),
        }
    }
}

/// A decoded raw event as delivered by an ingestion client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source: String,
    pub payload: Value,
    /// Receive time in Unix milliseconds, when the client stamped one.
    #[serde(default)]
    pub received_at: Option<i64>,
    #[serde(default)]
    pub region: Option<EventRegion>,
}

/// Table-driven normalizer over all configured sources.
#[derive(Clone)]
pub struct Normalizer {
    mappings: BTreeMap<String, Arc<CompiledMapping>>,
    clock: Arc<dyn Clock>,
}

impl Normalizer {
    /// Compile every source mapping. Any invalid entry is fatal.
    pub fn new(sources: &BTreeMap<String, SourceMapping>) -> Result<Self, ConfigurationError> {
        Self::with_clock(sources, Arc::new(SystemClock))
    }

    pub fn with_clock(
        sources: &BTreeMap<String, SourceMapping>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigurationError> {
        if sources.is_empty() {
            return Err(ConfigurationError::NoSources);
        }

        let mut mappings = BTreeMap::new();
        for (source, mapping) in sources {
            let compiled = CompiledMapping::compile(source, mapping)?;
            debug!(source = %source, metadata_paths = compiled.metadata.len(), "Compiled source mapping");
            mappings.insert(source.clone(), Arc::new(compiled));
        }

        info!(sources = mappings.len(), "Normalizer initialized");
        Ok(Self { mappings, clock })
    }

    /// Normalize a payload, stamping `observed_at` from the clock.
    pub fn normalize(&self, source: &str, payload: &Value) -> Result<Job, SchemaMappingError> {
        self.normalize_at(source, payload, self.clock.now_ms())
    }

    /// Normalize a payload observed at the given Unix millisecond time.
    ///
    /// Times outside `0..=MAX_OBSERVED_AT_MS` are rejected.
    pub fn normalize_at(&self, source: &str, payload: &Value, observed_at: i64) -> Result<Job, SchemaMappingError> {
        let mapping = self
            .mappings
            .get(source)
            .ok_or_else(|| SchemaMappingError::unknown_source(source))?;
        if !(0..=MAX_OBSERVED_AT_MS).contains(&observed_at) {
            return Err(SchemaMappingError::new(
                source,
                "observed_at",
                MappingFailure::InvalidValue(format!("timestamp {} out of range", observed_at)),
            ));
        }
        mapping.apply(payload, observed_at)
    }

    /// Normalize a delivered event, preferring the client's receive stamp
    /// and preserving its region in the job metadata.
    pub fn normalize_event(&self, event: &RawEvent) -> Result<Job, SchemaMappingError> {
        let observed_at = event.received_at.unwrap_or_else(|| self.clock.now_ms());
        let mut job = self.normalize_at(&event.source, &event.payload, observed_at)?;
        if let Some(region) = &event.region {
            for (key, value) in [(SOURCE_REGION_KEY, &region.source), (TARGET_REGION_KEY, &region.target)] {
                if let Some(value) = value {
                    job.metadata.insert(key.to_string(), Value::String(value.clone()));
                }
            }
        }
        Ok(job)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.mappings.keys().map(|s| s.as_str())
    }
}
