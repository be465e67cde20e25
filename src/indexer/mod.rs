pub mod abi;
pub mod aggregation;
pub mod checkpoint;
pub mod decoder;
pub mod processor;
pub mod sources;
pub mod transformations;

use anyhow::{Context, Result, bail};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use crate::indexer::checkpoint::{Checkpoint, Paginator};
use crate::indexer::processor::ChainProcessor;
use crate::indexer::sources::explorer::ExplorerClient;
use crate::indexer::sources::rpc::RpcClient;
use crate::indexer::sources::{ChainReader, NoChainReader};
use crate::metrics::Metrics;
use crate::models::common::{ChainConfig, PublishConfig, PublishMode, RunSummary, SourceConfig};
use crate::storage::http::{BackfillSource, HttpImportClient};
use crate::storage::local::{CheckpointStore, LocalArtifacts};
use crate::storage::{BatchPublisher, Destination};

fn connect_rpc(chain: &ChainConfig, metrics: Option<&Metrics>) -> Result<Option<RpcClient>> {
    let Some(rpc_url) = chain.source.rpc_url() else {
        return Ok(None);
    };
    let client = RpcClient::connect(
        rpc_url,
        chain.contract()?,
        Duration::from_secs(chain.request_timeout_secs),
        metrics.cloned(),
    )?;
    Ok(Some(client))
}

async fn verify_chain_id(chain: &ChainConfig, rpc: &RpcClient) -> Result<()> {
    let chain_id = rpc.get_chain_id().await?;
    info!("Chain ID: {}", chain_id);
    if chain_id != chain.chain_id {
        bail!(
            "RPC endpoint for {} reports chain id {}, expected {}",
            chain.chain_name,
            chain_id,
            chain.chain_id
        );
    }
    Ok(())
}

fn http_client(publish: &PublishConfig) -> Result<HttpImportClient> {
    let api_url = publish
        .api_url
        .as_deref()
        .context("publish.api_url is required")?;
    let secret = publish
        .admin_secret
        .as_deref()
        .context("publish.admin_secret is required")?;
    Ok(HttpImportClient::new(
        api_url,
        &publish.secret_header,
        secret,
        Duration::from_secs(publish.request_timeout_secs),
    )?)
}

/// Runs one pass over a chain: fetch, reconstruct, aggregate, publish.
pub async fn run_chain(
    chain: &ChainConfig,
    publish: &PublishConfig,
    metrics: Option<Metrics>,
    shutdown: broadcast::Receiver<()>,
) -> Result<RunSummary> {
    if publish.mode == PublishMode::Backfill {
        return run_backfill(chain, publish, metrics, shutdown).await;
    }

    let address = chain.contract()?;
    let rpc = connect_rpc(chain, metrics.as_ref())?;
    if let Some(rpc) = &rpc {
        verify_chain_id(chain, rpc).await?;
    }

    let destination = match publish.mode {
        PublishMode::LocalOnly => Destination::LocalOnly,
        _ => Destination::Http(http_client(publish)?),
    };
    let artifacts = chain.artifacts_dir.clone().map(LocalArtifacts::new);
    let publisher = BatchPublisher::new(destination, publish.batch_size, artifacts, metrics.clone());
    let store = chain.checkpoint_path.clone().map(CheckpointStore::new);

    let mut processor =
        ChainProcessor::new(chain.clone(), publisher, store, shutdown, metrics.clone()).await;

    match (&chain.source, &rpc) {
        (SourceConfig::Explorer { api_url, .. }, _) => {
            let explorer = ExplorerClient::new(
                api_url,
                address,
                Duration::from_secs(chain.request_timeout_secs),
                metrics.clone(),
            )?;
            match &rpc {
                Some(rpc) => ingest_explorer(&mut processor, &explorer, rpc).await?,
                None => ingest_explorer(&mut processor, &explorer, &NoChainReader).await?,
            }
        }
        (SourceConfig::Rpc { range_size, .. }, Some(rpc)) => {
            processor.skip_transaction_phase();
            let source = rpc
                .log_source(processor.lower_bound(), chain.end_block, *range_size)
                .await?;
            processor.ingest_logs(&source, rpc, true).await?;
        }
        (SourceConfig::Rpc { .. }, None) => bail!("RPC source for {} has no endpoint", chain.chain_name),
    }

    Ok(processor.finish().await)
}

async fn ingest_explorer<R: ChainReader>(
    processor: &mut ChainProcessor<Destination>,
    explorer: &ExplorerClient,
    reader: &R,
) -> Result<()> {
    processor
        .ingest_transactions(&explorer.transactions(), reader)
        .await?;
    if processor.is_stopping() {
        return Ok(());
    }
    processor.ingest_logs(&explorer.logs(), reader, false).await
}

/// Delegates ingestion to the remote side, one block window at a time.
pub async fn run_backfill(
    chain: &ChainConfig,
    publish: &PublishConfig,
    metrics: Option<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<RunSummary> {
    let rpc = connect_rpc(chain, metrics.as_ref())?
        .context("backfill needs an RPC endpoint to resolve the chain head")?;
    verify_chain_id(chain, &rpc).await?;
    let client = http_client(publish)?;

    let store = chain.checkpoint_path.clone().map(CheckpointStore::new);
    let mut checkpoint = match &store {
        Some(store) => store.load(chain.chain_id).await,
        None => Checkpoint::new(chain.chain_id),
    };
    checkpoint.begin_pass();

    let latest = rpc.get_latest_block_number().await?;
    let head = chain.end_block.map_or(latest, |end| end.min(latest));
    let start = if checkpoint.high_water_block > 0 {
        chain.start_block.max(checkpoint.high_water_block + 1)
    } else {
        chain.start_block
    };

    let mut summary = RunSummary {
        chain_id: chain.chain_id,
        ..Default::default()
    };
    let Some(cursor) = checkpoint.logs.resume_cursor() else {
        return Ok(summary);
    };

    let source = BackfillSource::new(&client, chain.chain_id, start, head, chain.source.range_size());
    let mut paginator = Paginator::new(
        &source,
        &chain.retry,
        cursor,
        Duration::from_millis(chain.page_delay_ms),
        metrics.clone(),
    );

    let result = loop {
        match paginator.next_page().await {
            Ok(Some(page)) => {
                summary.backfill_events_found += page.items.iter().sum::<u64>();
                if let Some((_, to)) = paginator.last_window() {
                    checkpoint.observe_block(to);
                    if let Some(metrics) = &metrics {
                        metrics.record_block(to);
                    }
                }
                Checkpoint::advance(&mut checkpoint.logs, paginator.cursor());
                if let Some(store) = &store {
                    store.save(&mut checkpoint).await?;
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
        if shutdown.try_recv().is_ok() {
            info!("Shutdown requested, stopping backfill after the current window");
            paginator.stop();
            break Ok(());
        }
    };

    let controller = paginator.controller();
    summary.pages_fetched = controller.pages_fetched;
    summary.pages_skipped = controller.pages_skipped;
    summary.retries = controller.total_retries;

    if result.is_ok() && paginator.cursor().is_none() {
        Checkpoint::advance(&mut checkpoint.logs, None);
        Checkpoint::advance(&mut checkpoint.transactions, None);
        checkpoint.finish_pass();
    }
    if let Some(store) = &store {
        store.save(&mut checkpoint).await?;
    }

    result.map(|()| summary)
}
