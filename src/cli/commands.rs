use anyhow::{Context, Result};
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};

use super::input::{ActionTemplate, NdjsonSource};
use crate::core::Core;
use crate::pool::Endpoint;
use crate::retry::SubmitStatsSnapshot;

/// Outcome of a `ship` run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShipReport {
    pub read: usize,
    pub skipped: usize,
    /// Left unsent because of shutdown
    pub abandoned: usize,
    pub stats: SubmitStatsSnapshot,
}

/// Ship NDJSON documents from `file` (stdin when `None`)
pub async fn cmd_ship(
    core: &Core,
    file: Option<&Path>,
    template: ActionTemplate,
    batch_size: usize,
) -> Result<()> {
    core.start().await?;

    // Ctrl-C abandons pending retries instead of killing the process
    let stopper = core.orchestrator.clone();
    let token = core.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    warn!("Interrupted, abandoning pending actions");
                    stopper.stop();
                }
            }
        }
    });

    let started = Instant::now();
    let result = match file {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input file: {}", path.display()))?;
            ship_from(core, BufReader::new(file), template, batch_size).await
        }
        None => ship_from(core, BufReader::new(tokio::io::stdin()), template, batch_size).await,
    };
    core.shutdown().await;
    let report = result?;

    println!("Read: {} documents ({} skipped)", report.read, report.skipped);
    println!("Indexed: {}", report.stats.document_successes);
    println!("Dead lettered: {}", report.stats.dlq_routed);
    println!("Dropped: {}", report.stats.non_retryable_failures);
    println!("Retried items: {}", report.stats.retryable_failures);
    println!("Failed bulk requests: {}", report.stats.bulk_failures);
    if report.abandoned > 0 {
        println!("Abandoned: {}", report.abandoned);
    }
    println!("Elapsed: {:.2}s", started.elapsed().as_secs_f64());

    Ok(())
}

/// Read batches from `reader` and ship each one through the retry loop
pub async fn ship_from<R: AsyncBufRead + Unpin>(
    core: &Core,
    reader: R,
    template: ActionTemplate,
    batch_size: usize,
) -> Result<ShipReport> {
    let mut source = NdjsonSource::new(reader, template);
    let mut report = ShipReport::default();

    while let Some(batch) = source.next_batch(batch_size.max(1)).await? {
        if batch.is_empty() {
            continue;
        }
        report.read += batch.len();

        let abandoned = core.ship(batch).await?;
        if !abandoned.is_empty() {
            report.abandoned += abandoned.len();
            break;
        }
        info!(read = report.read, "Batch shipped");
    }

    report.skipped = source.skipped();
    report.stats = core.stats();
    Ok(report)
}

/// Register the hosts and print what the pool sees
pub async fn cmd_health(core: &Core) -> Result<()> {
    let started = core.start().await;
    let endpoints = core.pool.endpoint_snapshot();
    core.shutdown().await;
    started?;

    println!("{}", format_endpoints(&endpoints));
    if let Some(major) = core.pool.maximum_seen_major_version() {
        println!("Maximum seen major version: {}", major);
    }
    if let Some(flavor) = core.pool.build_flavor() {
        println!("Build flavor: {}", flavor.as_str());
    }
    Ok(())
}

fn format_endpoints(endpoints: &[Endpoint]) -> String {
    let mut out = format!(
        "{:<40} {:<8} {:<10} {:<12} {}",
        "URL", "STATE", "VERSION", "FLAVOR", "LAST ERROR"
    );
    for endpoint in endpoints {
        out.push('\n');
        out.push_str(&format!(
            "{:<40} {:<8} {:<10} {:<12} {}",
            endpoint.url,
            endpoint.state.to_string(),
            endpoint.version.as_deref().unwrap_or("-"),
            endpoint
                .build_flavor
                .as_ref()
                .map(|f| f.as_str())
                .unwrap_or("-"),
            endpoint.last_error.as_deref().unwrap_or("")
        ));
    }
    out
}
