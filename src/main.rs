use anyhow::{Result, anyhow};
use tokio::{signal, sync::broadcast, time::Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{self, EnvFilter};

use contract_indexer::indexer;
use contract_indexer::metrics::Metrics;
use contract_indexer::models::common::RunSummary;
use contract_indexer::utils::load_config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    println!();
    info!("=========================== INITIALIZING ===========================");

    // Load config
    let config = match load_config("config.yml") {
        Ok(config) => {
            info!("Config loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load config: {}", e);
            return Err(anyhow!(e));
        }
    };

    info!(
        "Publish mode: {:?}, chains: {}",
        config.publish.mode,
        config.chains.len()
    );

    // Initialize optional metrics
    let metrics = if config.metrics.enabled {
        let metrics = Metrics::new("contract_indexer".to_string())?;
        metrics
            .start_metrics_server(&config.metrics.address, config.metrics.port)
            .await?;
        Some(metrics)
    } else {
        info!("Metrics are disabled");
        None
    };

    // Each chain finishes its current page before honoring Ctrl+C
    let (shutdown_tx, mut main_rx) = broadcast::channel::<()>(4);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Ok(()) = signal::ctrl_c().await {
            info!("Received Ctrl+C signal, initiating shutdown...");
            let _ = signal_tx.send(());
        }
    });

    println!();
    info!("========================= STARTING INDEXER =========================");

    let mut failed_chains = Vec::new();
    for chain in &config.chains {
        if main_rx.try_recv().is_ok() {
            info!("Shutting down before {}", chain.chain_name);
            break;
        }

        info!(
            "Processing {} (chain id {}) from block {}",
            chain.chain_name, chain.chain_id, chain.start_block
        );
        let chain_start = Instant::now();
        let chain_metrics = metrics.as_ref().map(|m| m.for_chain(&chain.chain_name));

        match indexer::run_chain(chain, &config.publish, chain_metrics, shutdown_tx.subscribe()).await
        {
            Ok(summary) => log_summary(&chain.chain_name, &summary, chain_start),
            Err(e) => {
                // One failing chain does not stop the others
                error!("Chain {} failed: {:#}", chain.chain_name, e);
                failed_chains.push(chain.chain_name.clone());
            }
        }
    }

    println!();
    info!("========================= INDEXER FINISHED =========================");
    if failed_chains.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("Failed chains: {}", failed_chains.join(", ")))
    }
}

fn log_summary(chain_name: &str, summary: &RunSummary, started: Instant) {
    info!(
        "{}: {} transactions, {} payloads, {} pool snapshots, {} solvers, {} days in {:.1}s",
        chain_name,
        summary.transactions,
        summary.payloads,
        summary.privacy_snapshots,
        summary.solvers,
        summary.daily_stats,
        started.elapsed().as_secs_f64()
    );
    for (kind, count) in &summary.events_by_kind {
        info!("{}:   {:?} x{}", chain_name, kind, count);
    }
    info!(
        "{}: pages fetched {}, skipped {}, retries {}, batches published {}, failed {}",
        chain_name,
        summary.pages_fetched,
        summary.pages_skipped,
        summary.retries,
        summary.batches_published,
        summary.batches_failed
    );
    if summary.backfill_events_found > 0 {
        info!(
            "{}: remote backfill found {} events",
            chain_name, summary.backfill_events_found
        );
    }
    if summary.unknown_events + summary.decode_failures + summary.orphan_logs > 0 {
        warn!(
            "{}: {} unknown events, {} decode failures, {} call decode failures, {} orphan logs, {} duplicate payloads, {} timestamp failures",
            chain_name,
            summary.unknown_events,
            summary.decode_failures,
            summary.call_decode_failures,
            summary.orphan_logs,
            summary.duplicate_payloads,
            summary.timestamp_failures
        );
    }
}
