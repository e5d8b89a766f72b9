//! End-to-end scenarios for the job correlator
//!
//! Drives raw payloads from the three built-in sources through the
//! synchronous engine and the async pipeline, checking:
//! - Cross-source matching and propagation samples
//! - Window bounds
//! - Idempotent re-delivery
//! - Per-source uniqueness and order-insensitivity (property based)

use std::collections::BTreeMap;

use job_correlator::config::MonitorConfig;
use job_correlator::engine::CorrelationEngine;
use job_correlator::ingestion::IngestionResult;
use job_correlator::normalizer::{EventRegion, RawEvent};
use job_correlator::pipeline::Pipeline;
use job_correlator::query::{JobFilter, MatchFilter, Page};
use monitor_types::correlation::MatchStatus;
use monitor_types::ids::SourceId;
use monitor_types::job::Job;
use monitor_types::propagation::PairStats;
use proptest::prelude::*;
use rust_decimal::Decimal;
use serde_json::{json, Value};

const HASH: &str = "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054";
const HASH2: &str = "0000000000000000000320283a032748cef8227873ff4872689bf23f1cda83a5";
const COINBASE1: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff";
const COINBASE2: &str = "ffffffff0100f2052a01000000434104";

fn observer_event(job_id: &str, height: u64, hash: &str, t: i64) -> RawEvent {
    RawEvent {
        source: "miningpool.observer".to_string(),
        payload: json!({
            "height": height,
            "pool": { "name": "Foundry USA", "difficulty": 86388558925171u64, "tag": "foundry" },
            "params": [
                job_id, hash, COINBASE1, COINBASE2,
                ["a1b2", "c3d4"], "20000000", "17034219", "65a8f1b2", true
            ]
        }),
        received_at: Some(t),
        region: Some(EventRegion::new("us-east", "eu")),
    }
}

fn work_event(job_id: &str, height: u64, hash: &str, t: i64) -> RawEvent {
    RawEvent {
        source: "stratum.work".to_string(),
        payload: json!({
            "pool": "Foundry USA",
            "server": "stratum.foundryusapool.com:3333",
            "job": {
                "id": job_id,
                "height": height,
                "prevHash": hash,
                "coinbase1": COINBASE1,
                "coinbase2": COINBASE2,
                "merkleBranches": ["A1B2", "C3D4"],
                "version": "20000000",
                "bits": "17034219",
                "time": 1_705_570_738u64,
                "cleanJobs": true
            }
        }),
        received_at: Some(t),
        region: Some(EventRegion::new("us-east", "us")),
    }
}

fn mempool_event(job_id: &str, height: u64, hash: &str, t: i64) -> RawEvent {
    RawEvent {
        source: "mempool.space".to_string(),
        payload: json!({
            "height": height,
            "params": [
                job_id, hash, COINBASE1, COINBASE2,
                ["a1b2", "c3d4"], "20000000", "17034219", "65a8f1b2", true
            ]
        }),
        received_at: Some(t),
        region: None,
    }
}

fn engine() -> CorrelationEngine {
    CorrelationEngine::new(MonitorConfig::default()).unwrap()
}

const PAIR: &str = "miningpool.observer|stratum.work";

#[test]
fn test_three_jobs_one_match() {
    let mut e = engine();
    e.ingest_raw(&observer_event("j1", 800_000, HASH, 0)).unwrap();
    e.ingest_raw(&work_event("j2", 800_000, HASH, 150)).unwrap();
    e.ingest_raw(&mempool_event("j3", 800_001, HASH2, 50)).unwrap();

    let frozen = e.flush();
    assert_eq!(frozen.len(), 1);
    let m = &frozen[0];
    assert_eq!(m.primary_job.job_id, "j1");
    assert_eq!(m.matched_jobs.len(), 1);
    assert_eq!(m.matched_jobs[0].job.job_id, "j2");
    assert!(m.matched_jobs[0].score >= 10);
    assert!(m.jobs().all(|j| j.job_id != "j3"));

    let q = e.query();
    let history = q.propagation_history(PAIR, None, None);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stats.sample_count, 1);
    assert_eq!(history[0].stats.min, 150);
    assert_eq!(history[0].stats.max, 150);
    assert_eq!(history[0].stats.stddev, 0.0);
    assert_eq!(q.service_pairs(), vec![PAIR.to_string()]);
    assert_eq!(q.region_propagation(None)["eu-us"].max, 150);

    let aggregates = q.aggregates();
    assert_eq!(aggregates.heights[&800_000].source_count(), 2);
    assert_eq!(aggregates.heights[&800_001].match_count, 0);
    assert_eq!(aggregates.agreement_rates[&SourceId::new("mempool.space")], 0.0);
    assert_eq!(aggregates.agreement_rates[&SourceId::new("stratum.work")], 1.0);
    assert_eq!(
        aggregates.regions.service_regions[&SourceId::new("mempool.space")]["unknown"],
        1
    );
}

#[test]
fn test_out_of_range_receive_time_rejected() {
    let mut e = engine();
    e.ingest_raw(&observer_event("j1", 800_000, HASH, 1_000)).unwrap();
    let late = e.ingest_raw(&work_event("j2", 800_000, HASH, i64::MIN + 10));
    assert!(late.is_err());
    assert!(e.flush().is_empty());
    assert_eq!(e.query().metrics()["events_rejected"], 1);
}

#[test]
fn test_region_and_metadata_preserved() {
    let mut e = engine();
    e.ingest_raw(&observer_event("j1", 800_000, HASH, 0)).unwrap();

    let jobs = e.query().list_jobs(&JobFilter::default(), Page::default());
    assert_eq!(jobs[0].target_region(), Some("eu"));
    assert_eq!(jobs[0].source_region(), Some("us-east"));
    assert_eq!(jobs[0].metadata.get("pool_tag"), Some(&json!("foundry")));
    assert_eq!(jobs[0].merkle_branches, vec!["a1b2".to_string(), "c3d4".to_string()]);
}

#[test]
fn test_outside_window_no_match() {
    let mut e = engine();
    e.ingest_raw(&observer_event("j1", 800_000, HASH, 0)).unwrap();
    e.ingest_raw(&work_event("j2", 800_000, HASH, 310_000)).unwrap();

    assert!(e.flush().is_empty());
    let q = e.query();
    assert!(q.list_matches(&MatchFilter::default(), Page::default()).is_empty());
    assert_eq!(q.list_jobs(&JobFilter::default(), Page::default()).len(), 2);
    assert_eq!(q.propagation_summary(PAIR, None), PairStats::empty());
}

#[test]
fn test_reingest_is_idempotent() {
    let mut e = engine();
    let j1 = observer_event("j1", 800_000, HASH, 0);
    let j2 = work_event("j2", 800_000, HASH, 150);

    e.ingest_raw(&j1).unwrap();
    e.ingest_raw(&j2).unwrap();
    let again = e.ingest_raw(&j2).unwrap();
    assert_eq!(again.result, IngestionResult::Dropped);
    e.ingest_raw(&j1).unwrap();
    e.flush();

    let q = e.query();
    assert_eq!(q.list_jobs(&JobFilter::default(), Page::default()).len(), 2);
    assert_eq!(q.list_matches(&MatchFilter::default(), Page::default()).len(), 1);
    assert_eq!(q.propagation_summary(PAIR, None).sample_count, 1);
}

#[test]
fn test_malformed_payload_rejected_pipeline_continues() {
    let mut e = engine();
    let mut broken = work_event("j2", 800_000, HASH, 150);
    broken.payload["job"]
        .as_object_mut()
        .unwrap()
        .remove("prevHash");
    assert!(e.ingest_raw(&broken).is_err());

    e.ingest_raw(&observer_event("j1", 800_000, HASH, 0)).unwrap();
    assert_eq!(e.query().list_jobs(&JobFilter::default(), Page::default()).len(), 1);
}

#[test]
fn test_zero_sample_pair_is_zeroed() {
    let e = engine();
    let q = e.query();
    assert!(q.propagation_history("mempool.space|stratum.work", None, None).is_empty());
    assert_eq!(q.propagation_summary("mempool.space|stratum.work", None), PairStats::empty());
}

#[test]
fn test_normalize_is_deterministic_over_payload() {
    let e = engine();
    let event = work_event("j2", 800_000, HASH, 0);
    let a = e.normalize(&event.source, &event.payload).unwrap();
    let b = e.normalize(&event.source, &event.payload).unwrap();
    assert_eq!(Job { observed_at: 0, ..a }, Job { observed_at: 0, ..b });
}

#[tokio::test]
async fn test_pipeline_shutdown_flushes_open_matches() {
    let (handle, query) = Pipeline::start(MonitorConfig::default()).unwrap();

    handle.ingest_raw(observer_event("j1", 800_000, HASH, 0)).await.unwrap();
    handle.ingest_raw(work_event("j2", 800_000, HASH, 150)).await.unwrap();
    handle.ingest_raw(mempool_event("j3", 800_001, HASH2, 50)).await.unwrap();
    handle.shutdown().await.unwrap();

    let matches = query.list_matches(&MatchFilter::default(), Page::default());
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].status, MatchStatus::Frozen);

    let history = query.propagation_history(PAIR, None, None);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stats.mean, 150.0);
    assert_eq!(query.metrics()["jobs_accepted"], 3);
}

#[tokio::test]
async fn test_pipeline_rejects_after_shutdown() {
    let (handle, _query) = Pipeline::start(MonitorConfig::default()).unwrap();
    let ingestor = handle.ingestor();
    handle.shutdown().await.unwrap();

    let result = ingestor.ingest_raw(observer_event("j1", 800_000, HASH, 0)).await;
    assert!(result.is_err());
}

// ── Properties ──────────────────────────────────────────────────────

fn job(source: &str, job_id: &str, observed_at: i64) -> Job {
    Job {
        source: SourceId::new(source),
        job_id: job_id.to_string(),
        observed_at,
        height: 800_000,
        prev_block_hash: HASH.to_string(),
        version: "20000000".to_string(),
        bits: "17034219".to_string(),
        time: 0,
        difficulty: Decimal::ZERO,
        clean_jobs: true,
        mining_pool: "Foundry USA".to_string(),
        coinbase_tx: format!("{}{}", COINBASE1, COINBASE2),
        merkle_branches: vec!["a1b2".to_string(), "c3d4".to_string()],
        metadata: BTreeMap::<String, Value>::new(),
    }
}

const SOURCES: [&str; 4] = ["miningpool.observer", "stratum.work", "mempool.space", "pool.local"];

proptest! {
    #[test]
    fn prop_twins_match_regardless_of_order(
        times in proptest::collection::vec(0i64..250_000, 4),
        order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
    ) {
        let mut e = engine();
        for &i in &order {
            e.ingest(job(SOURCES[i], &format!("j{}", i), times[i]));
        }
        let frozen = e.flush();

        prop_assert_eq!(frozen.len(), 1);
        let m = &frozen[0];
        prop_assert_eq!(m.len(), 4);
        let earliest = *times.iter().min().unwrap();
        prop_assert_eq!(m.primary_job.observed_at, earliest);
        prop_assert!(m.check_invariants().is_ok());
    }

    #[test]
    fn prop_no_match_repeats_a_source(
        arrivals in proptest::collection::vec((0usize..4, 0i64..600_000), 1..40),
    ) {
        let mut e = engine();
        for (n, (s, t)) in arrivals.iter().enumerate() {
            e.ingest(job(SOURCES[*s], &format!("j{}", n), *t));
        }
        e.flush();

        let matches = e.query().list_matches(&MatchFilter::default(), Page::new(0, 1_000));
        for m in &matches {
            prop_assert!(m.check_invariants().is_ok());
        }
    }

    #[test]
    fn prop_delta_is_absolute_difference(a in 0i64..299_000, b in 0i64..299_000) {
        let mut e = engine();
        e.ingest(job(SOURCES[0], "x", a));
        e.ingest(job(SOURCES[1], "y", b));
        e.flush();

        let samples = e.state().analyzer.samples(
            &monitor_types::ids::ServicePair::parse(PAIR).unwrap(),
        );
        prop_assert_eq!(samples.len(), 1);
        prop_assert_eq!(samples[0].delta_ms, (a - b).abs());
        prop_assert!(samples[0].delta_ms >= 0);
    }
}
