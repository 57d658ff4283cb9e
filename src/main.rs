//! Query metric service, standalone
//!
//! Reads query metric updates as JSON lines (one update object, or an array
//! of updates, per line), delivers them through the acknowledged transport
//! into an in-process cache and column store, then prints the merged
//! metrics and a summary.
//!
//! ```text
//! query-metric-service [CONFIG.toml] < updates.jsonl
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | QM_CONFIG | - | Config file (the first argument wins) |
//! | QM_INPUT | stdin | JSON-lines update file |
//! | QM_* | - | Per-setting overrides, see `config` |
//! | RUST_LOG | - | Log filter, overrides `logging.level` |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use query_metrics::delivery::{ChannelTransport, ConfirmationSender, DeliveryCoordinator};
use query_metrics::observability::init_tracing;
use query_metrics::service::LoggingStatsSink;
use query_metrics::{MetricError, QueryMetricService, QueryMetricUpdate, ServiceConfig};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const TRANSPORT_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("QM_CONFIG").ok())
        .map(PathBuf::from);
    let config = ServiceConfig::load(config_path.as_deref())?;
    init_tracing(&config.logging)?;

    let service = Arc::new(QueryMetricService::in_memory(config.clone()));
    let (transport, envelopes) = ChannelTransport::new(TRANSPORT_CAPACITY);
    let (confirm, confirmations) = ConfirmationSender::channel();
    service.spawn_consumer(envelopes, confirm);
    service.spawn_reporter(Arc::new(LoggingStatsSink));

    let coordinator = DeliveryCoordinator::new(Arc::new(transport), config.delivery.clone());
    coordinator.spawn_ack_listener(confirmations);

    let updates = match std::env::var("QM_INPUT") {
        Ok(path) => {
            let file = tokio::fs::File::open(&path).await?;
            read_updates(BufReader::new(file)).await?
        }
        Err(_) => read_updates(BufReader::new(tokio::io::stdin())).await?,
    };
    info!(updates = updates.len(), "submitting updates");

    let mut failed = 0usize;
    for (update, result) in updates.iter().zip(coordinator.submit_all(&updates).await) {
        if let Err(e) = result {
            failed += 1;
            warn!(query_id = update.query_id(), error = %e, "update not delivered");
        }
    }

    let query_ids: BTreeSet<&str> = updates.iter().map(|u| u.query_id()).collect();
    for query_id in query_ids {
        if let Some(metric) = service.get_metric(query_id).await? {
            println!("{}", serde_json::to_string(&metric)?);
        }
    }

    let summary = service.summary(None, None, None, false).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let stats = service.cache_stats().await?;
    println!();
    println!("Delivered: {}/{}", updates.len() - failed, updates.len());
    println!("Cache entries: {}", stats.entries);
    println!("Cache hit ratio: {:.2}", stats.hit_ratio());

    service.shutdown().await;
    Ok(())
}

async fn read_updates<R>(reader: R) -> Result<Vec<QueryMetricUpdate>, MetricError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut updates = Vec::new();
    let mut line_number = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| MetricError::Validation(format!("cannot read input: {}", e)))?
    {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = if line.starts_with('[') {
            QueryMetricUpdate::batch_from_json(line)
        } else {
            QueryMetricUpdate::from_json(line).map(|u| vec![u])
        };
        match parsed {
            Ok(batch) => updates.extend(batch),
            Err(e) => warn!(line = line_number, error = %e, "skipping malformed update"),
        }
    }
    Ok(updates)
}
