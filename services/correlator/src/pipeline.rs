//! Async pipeline
//!
//! ```text
//!  ingest / ingest_raw ──► mpsc ──► dispatcher ──┬──► shard 0 (Matcher)
//!                                  dedup,        ├──► shard 1 (Matcher)
//!                                  watermark     └──► shard N (Matcher)
//!                                                        │
//!                                         MonitorState folds (DashMap per key)
//! ```
//!
//! The dispatcher is the single ordered consumer of the inbound stream. Each
//! [`JobKey`] hashes to exactly one shard, so every bucket has one writer and
//! scoring plus insertion is a single step. Different keys are matched in
//! parallel. Watermark movements are broadcast to every shard so idle keys
//! still freeze on time.
//!
//! Shutdown closes the inbound channel, drains every job already queued
//! (whichever producer sent it), closes the shards, and each shard flushes
//! its open matches before exiting. A send that loses the race with shutdown
//! fails with [`MonitorError::PipelineClosed`]; a send that succeeded is
//! always processed.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use monitor_types::errors::{ConfigurationError, MonitorError, SchemaMappingError};
use monitor_types::ids::JobKey;
use monitor_types::job::Job;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::engine::MonitorState;
use crate::ingestion::{IngesterConfig, IngestionResult, JobIngester};
use crate::matcher::Matcher;
use crate::normalizer::{Normalizer, RawEvent};
use crate::query::MonitorQuery;

enum Inbound {
    Job(Job),
    Shutdown,
}

enum ShardCommand {
    Job(Job),
    Advance(i64),
}

/// Shard owning `key`.
pub fn shard_for(key: &JobKey, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Cloneable producer side of the pipeline.
#[derive(Clone)]
pub struct Ingestor {
    tx: mpsc::Sender<Inbound>,
    normalizer: Normalizer,
    state: Arc<MonitorState>,
    errors: broadcast::Sender<MonitorError>,
}

impl Ingestor {
    /// Feed a normalized job. Resolves once the job is queued.
    pub async fn ingest(&self, job: Job) -> Result<(), MonitorError> {
        self.state.metrics.record_received();
        self.tx
            .send(Inbound::Job(job))
            .await
            .map_err(|_| MonitorError::PipelineClosed)
    }

    /// Normalize and feed a delivered event. A mapping failure rejects
    /// this event only and is published on the error channel.
    pub async fn ingest_raw(&self, event: RawEvent) -> Result<(), MonitorError> {
        let job = match self.normalizer.normalize_event(&event) {
            Ok(job) => job,
            Err(e) => {
                self.state.metrics.record_received();
                self.state.metrics.record_rejected();
                warn!(source = %event.source, error = %e, "Rejected raw event");
                let err = MonitorError::Mapping(e);
                let _ = self.errors.send(err.clone());
                return Err(err);
            }
        };
        self.ingest(job).await
    }

    pub fn normalize(&self, source: &str, payload: &Value) -> Result<Job, SchemaMappingError> {
        self.normalizer.normalize(source, payload)
    }
}

/// Owner handle of a running pipeline.
pub struct PipelineHandle {
    ingestor: Ingestor,
    dispatcher: JoinHandle<()>,
}

/// Entry point for the async pipeline.
pub struct Pipeline;

impl Pipeline {
    /// Validate the configuration and spawn the dispatcher and shard tasks.
    /// Must be called within a tokio runtime.
    pub fn start(config: MonitorConfig) -> Result<(PipelineHandle, MonitorQuery), ConfigurationError> {
        config.validate()?;
        let normalizer = Normalizer::new(&config.sources)?;

        let pipeline_config = config.pipeline.clone();
        let matcher_config = config.matcher.clone();
        let state = Arc::new(MonitorState::new(config));
        let (errors, _) = broadcast::channel(pipeline_config.error_channel_capacity);

        let mut shard_txs = Vec::with_capacity(pipeline_config.shards);
        let mut shard_handles = Vec::with_capacity(pipeline_config.shards);
        for id in 0..pipeline_config.shards {
            let (tx, rx) = mpsc::channel(pipeline_config.channel_capacity);
            let matcher = Matcher::new(matcher_config.clone());
            shard_handles.push(tokio::spawn(run_shard(
                id,
                rx,
                matcher,
                Arc::clone(&state),
                errors.clone(),
            )));
            shard_txs.push(tx);
        }

        let (tx, rx) = mpsc::channel(pipeline_config.channel_capacity);
        let ingester = JobIngester::new(IngesterConfig {
            dedup_window: pipeline_config.dedup_window,
        });
        let dispatcher = tokio::spawn(run_dispatcher(
            rx,
            ingester,
            shard_txs,
            shard_handles,
            Arc::clone(&state),
            pipeline_config.advance_granularity_ms,
        ));

        info!(
            shards = pipeline_config.shards,
            channel_capacity = pipeline_config.channel_capacity,
            "Pipeline started"
        );

        let handle = PipelineHandle {
            ingestor: Ingestor {
                tx,
                normalizer,
                state: Arc::clone(&state),
                errors,
            },
            dispatcher,
        };
        Ok((handle, MonitorQuery::new(state)))
    }
}

impl PipelineHandle {
    pub fn ingestor(&self) -> Ingestor {
        self.ingestor.clone()
    }

    pub async fn ingest(&self, job: Job) -> Result<(), MonitorError> {
        self.ingestor.ingest(job).await
    }

    pub async fn ingest_raw(&self, event: RawEvent) -> Result<(), MonitorError> {
        self.ingestor.ingest_raw(event).await
    }

    pub fn normalize(&self, source: &str, payload: &Value) -> Result<Job, SchemaMappingError> {
        self.ingestor.normalize(source, payload)
    }

    /// Per-event errors (mapping rejections, invariant violations).
    pub fn subscribe_errors(&self) -> broadcast::Receiver<MonitorError> {
        self.ingestor.errors.subscribe()
    }

    /// Process everything already queued, freeze all open matches and stop.
    pub async fn shutdown(self) -> Result<(), MonitorError> {
        info!("Pipeline shutdown requested");
        self.ingestor
            .tx
            .send(Inbound::Shutdown)
            .await
            .map_err(|_| MonitorError::PipelineClosed)?;
        if let Err(e) = self.dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
            return Err(MonitorError::PipelineClosed);
        }
        info!("Pipeline stopped");
        Ok(())
    }
}

async fn run_dispatcher(
    mut rx: mpsc::Receiver<Inbound>,
    mut ingester: JobIngester,
    shards: Vec<mpsc::Sender<ShardCommand>>,
    shard_handles: Vec<JoinHandle<()>>,
    state: Arc<MonitorState>,
    advance_granularity_ms: i64,
) {
    let mut last_advance: Option<i64> = None;

    while let Some(inbound) = rx.recv().await {
        let job = match inbound {
            Inbound::Job(job) => job,
            Inbound::Shutdown => {
                // Refuse new sends; jobs already queued are still processed.
                rx.close();
                debug!("Inbound channel closed, draining");
                continue;
            }
        };

        match ingester.ingest(&job) {
            IngestionResult::Accepted => {}
            IngestionResult::Dropped => {
                state.metrics.record_duplicate();
                continue;
            }
            IngestionResult::Rejected => {
                state.metrics.record_rejected();
                continue;
            }
        }
        state.on_accepted(&job);

        let shard = shard_for(&job.key(), shards.len());
        if shards[shard].send(ShardCommand::Job(job)).await.is_err() {
            error!(shard, "Shard channel closed, stopping dispatcher");
            break;
        }

        let Some(watermark) = ingester.watermark() else {
            continue;
        };
        let due = last_advance.map_or(true, |last| watermark - last >= advance_granularity_ms);
        if due {
            last_advance = Some(watermark);
            state.on_watermark(watermark);
            for tx in &shards {
                if tx.send(ShardCommand::Advance(watermark)).await.is_err() {
                    error!("Shard channel closed while advancing");
                }
            }
        }
    }

    // Final watermark so shards freeze anything already elapsed before flush.
    if let Some(watermark) = ingester.watermark() {
        state.on_watermark(watermark);
        for tx in &shards {
            let _ = tx.send(ShardCommand::Advance(watermark)).await;
        }
    }

    drop(shards);
    for (id, handle) in shard_handles.into_iter().enumerate() {
        if let Err(e) = handle.await {
            error!(shard = id, error = %e, "Shard task failed");
        }
    }

    info!(
        accepted = ingester.jobs_accepted(),
        duplicates = ingester.jobs_dropped(),
        late = ingester.late_arrivals(),
        "Dispatcher stopped"
    );
}

async fn run_shard(
    id: usize,
    mut rx: mpsc::Receiver<ShardCommand>,
    mut matcher: Matcher,
    state: Arc<MonitorState>,
    errors: broadcast::Sender<MonitorError>,
) {
    debug!(shard = id, "Shard started");

    while let Some(command) = rx.recv().await {
        let frozen = match command {
            ShardCommand::Job(job) => {
                let started = Instant::now();
                let outcome = matcher.insert(job);
                state.on_outcome(outcome);
                let frozen = match matcher.watermark() {
                    Some(w) => matcher.advance(w),
                    None => Vec::new(),
                };
                state
                    .metrics
                    .record_processing(started.elapsed().as_nanos() as u64);
                frozen
            }
            ShardCommand::Advance(watermark) => matcher.advance(watermark),
        };
        publish(&errors, state.on_frozen(frozen));
    }

    let frozen = matcher.flush();
    let count = frozen.len();
    publish(&errors, state.on_frozen(frozen));
    info!(shard = id, flushed = count, "Shard stopped");
}

fn publish(errors: &broadcast::Sender<MonitorError>, batch: Vec<MonitorError>) {
    for e in batch {
        warn!(error = %e, "Per-event error");
        // No subscribers is fine; the error is already logged.
        let _ = errors.send(e);
    }
}
