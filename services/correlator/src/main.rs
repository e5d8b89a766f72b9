use std::path::PathBuf;

use job_correlator::config::MonitorConfig;
use job_correlator::normalizer::RawEvent;
use job_correlator::pipeline::Pipeline;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Replays newline-delimited raw events from stdin through the pipeline.
///
/// Usage: `job-correlator [config.json] < events.jsonl`
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    tracing::info!("Starting job correlator v{}", job_correlator::SERVICE_VERSION);

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => MonitorConfig::from_file(&path)?,
        None => {
            let config = MonitorConfig::default();
            config.validate()?;
            config
        }
    };

    let (handle, query) = Pipeline::start(config)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let event: RawEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(line = line_no, error = %e, "Skipping undecodable line");
                continue;
            }
        };
        // Mapping failures are logged by the pipeline; keep replaying.
        let _ = handle.ingest_raw(event).await;
    }

    handle.shutdown().await?;

    let report = serde_json::json!({
        "aggregates": query.aggregates(),
        "service_pairs": query
            .service_pairs()
            .into_iter()
            .map(|pair| {
                let summary = query.propagation_summary(&pair, None);
                (pair, summary)
            })
            .collect::<std::collections::BTreeMap<_, _>>(),
        "region_propagation": query.region_propagation(None),
        "first_providers": query.first_providers(),
        "metrics": query.metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
