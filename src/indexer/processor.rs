use anyhow::Result;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use crate::indexer::checkpoint::{Checkpoint, Paginator, PhaseProgress, RetryController};
use crate::indexer::sources::{ChainReader, PageSource};
use crate::indexer::transformations::ReconstructionContext;
use crate::indexer::transformations::logs::LogTransformer;
use crate::indexer::transformations::transactions::TransactionTransformer;
use crate::metrics::Metrics;
use crate::models::common::{ChainConfig, PoolSizeMode, RunSummary};
use crate::models::datasets::logs::RawLogData;
use crate::models::datasets::privacy::PrivacyPoolSnapshot;
use crate::models::datasets::transactions::RawTransactionData;
use crate::storage::local::CheckpointStore;
use crate::storage::{BatchPublisher, ImportSink, PageLabel};

/// Drives one chain through its transaction and log phases, one page at a time.
pub struct ChainProcessor<S: ImportSink> {
    chain: ChainConfig,
    ctx: ReconstructionContext,
    publisher: BatchPublisher<S>,
    store: Option<CheckpointStore>,
    checkpoint: Checkpoint,
    shutdown: broadcast::Receiver<()>,
    stopping: bool,
    metrics: Option<Metrics>,
}

impl<S: ImportSink> ChainProcessor<S> {
    pub async fn new(
        chain: ChainConfig,
        publisher: BatchPublisher<S>,
        store: Option<CheckpointStore>,
        shutdown: broadcast::Receiver<()>,
        metrics: Option<Metrics>,
    ) -> Self {
        let mut checkpoint = match &store {
            Some(store) => store.load(chain.chain_id).await,
            None => Checkpoint::new(chain.chain_id),
        };
        checkpoint.begin_pass();

        let mut ctx = ReconstructionContext::new(chain.chain_id, chain.max_blob_bytes, metrics.clone());
        if !checkpoint.pass_transactions.is_empty() {
            info!(
                "Resuming {} with {} transactions from the interrupted pass",
                chain.chain_name,
                checkpoint.pass_transactions.len()
            );
            for record in &checkpoint.pass_transactions {
                ctx.restore_transaction(record.clone());
            }
        }
        Self {
            chain,
            ctx,
            publisher,
            store,
            checkpoint,
            shutdown,
            stopping: false,
            metrics,
        }
    }

    pub fn is_stopping(&mut self) -> bool {
        if !self.stopping {
            match self.shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Lagged(_)) => {
                    info!("Shutdown requested, stopping {} after the current page", self.chain.chain_name);
                    self.stopping = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {}
            }
        }
        self.stopping
    }

    /// Logs-only sources have no transaction listing to walk.
    pub fn skip_transaction_phase(&mut self) {
        Checkpoint::advance(&mut self.checkpoint.transactions, None);
    }

    /// First block this pass still has to cover.
    pub fn lower_bound(&self) -> u64 {
        if self.checkpoint.high_water_block > 0 {
            self.chain.start_block.max(self.checkpoint.high_water_block + 1)
        } else {
            self.chain.start_block
        }
    }

    /// Keeps items inside `[lower_bound, end_block]`. The flag reports whether the page
    /// reached below the lower bound, which ends a newest-first listing.
    fn clip<T>(&self, items: Vec<T>, block_of: impl Fn(&T) -> u64) -> (Vec<T>, bool) {
        let lower = self.lower_bound();
        let end = self.chain.end_block.unwrap_or(u64::MAX);
        let total = items.len();
        let mut reached_floor = false;
        let kept: Vec<T> = items
            .into_iter()
            .filter(|item| {
                let block = block_of(item);
                if block < lower {
                    reached_floor = true;
                }
                block >= lower && block <= end
            })
            .collect();
        if kept.len() < total {
            debug!("Dropped {} items outside blocks {} to {}", total - kept.len(), lower, end);
        }
        (kept, reached_floor)
    }

    fn tally(&mut self, controller: &RetryController) {
        self.ctx.summary.pages_fetched += controller.pages_fetched;
        self.ctx.summary.pages_skipped += controller.pages_skipped;
        self.ctx.summary.retries += controller.total_retries;
    }

    async fn save_checkpoint(&mut self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&mut self.checkpoint).await {
                error!("Failed to save checkpoint {}: {}", store.path().display(), e);
            }
        }
    }

    fn page_delay(&self) -> Duration {
        Duration::from_millis(self.chain.page_delay_ms)
    }

    /// Paginates the authoritative transaction listing.
    pub async fn ingest_transactions<P, R>(&mut self, source: &P, reader: &R) -> Result<()>
    where
        P: PageSource<Item = RawTransactionData>,
        R: ChainReader,
    {
        let Some(cursor) = self.checkpoint.transactions.resume_cursor() else {
            info!("Transaction phase already complete for {}", self.chain.chain_name);
            return Ok(());
        };

        info!("Ingesting transactions for {} from {:?}", self.chain.chain_name, cursor);
        let mut paginator = Paginator::new(
            source,
            &self.chain.retry,
            cursor,
            self.page_delay(),
            self.metrics.clone(),
        );

        let result = loop {
            let page = match paginator.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let (mut items, reached_floor) = self.clip(page.items, |tx| tx.block_number);

            let missing: Vec<u64> = items
                .iter()
                .filter(|tx| tx.timestamp.is_none())
                .map(|tx| tx.block_number)
                .collect();
            if !missing.is_empty() {
                self.ctx.resolve_timestamps(&missing, reader).await;
                for tx in items.iter_mut().filter(|tx| tx.timestamp.is_none()) {
                    tx.timestamp = self.ctx.cached_timestamp(tx.block_number);
                }
            }

            let block_range = block_span(items.iter().map(|tx| tx.block_number));
            let created = items.transform_transactions(&mut self.ctx);
            self.checkpoint.absorb_transactions(&created);

            let events = self.ctx.drain_dirty();
            self.publisher
                .publish_page(PageLabel::Transactions, &events, &[], block_range)
                .await;
            if let (Some(metrics), Some((_, to))) = (&self.metrics, block_range) {
                metrics.record_block(to);
            }

            if reached_floor {
                info!("Reached previously indexed blocks, transaction phase complete");
                paginator.stop();
                Checkpoint::advance(&mut self.checkpoint.transactions, None);
            } else {
                Checkpoint::advance(&mut self.checkpoint.transactions, paginator.cursor());
            }
            self.save_checkpoint().await;

            if reached_floor {
                break Ok(());
            }
            if self.is_stopping() {
                paginator.stop();
                break Ok(());
            }
        };

        self.tally(paginator.controller());
        if result.is_ok() && !self.stopping && paginator.cursor().is_none() {
            Checkpoint::advance(&mut self.checkpoint.transactions, None);
            self.save_checkpoint().await;
        }
        result
    }

    /// Paginates contract logs. With `resolve_missing`, primary events for transactions not
    /// seen yet are looked up through `reader` so they get an authoritative record.
    pub async fn ingest_logs<P, R>(&mut self, source: &P, reader: &R, resolve_missing: bool) -> Result<()>
    where
        P: PageSource<Item = RawLogData>,
        R: ChainReader,
    {
        let Some(cursor) = self.checkpoint.logs.resume_cursor() else {
            info!("Log phase already complete for {}", self.chain.chain_name);
            return Ok(());
        };

        info!("Ingesting logs for {} from {:?}", self.chain.chain_name, cursor);
        let mut paginator = Paginator::new(
            source,
            &self.chain.retry,
            cursor,
            self.page_delay(),
            self.metrics.clone(),
        );

        let result = loop {
            let page = match paginator.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            let (logs, reached_floor) = self.clip(page.items, |log| log.block_number);

            let mut resolved = Vec::new();
            if resolve_missing {
                for tx_hash in self.ctx.unseen_primary_hashes(&logs) {
                    match reader.transaction(tx_hash).await {
                        Ok(Some(tx)) => resolved.push(tx),
                        Ok(None) => debug!("Transaction {} not found", tx_hash),
                        Err(e) => warn!("Failed to resolve transaction {}: {}", tx_hash, e),
                    }
                }
            }

            let mut needs_timestamp: Vec<u64> = logs
                .iter()
                .filter(|log| log.timestamp.is_none() && !self.ctx.contains_transaction(&log.tx_hash))
                .map(|log| log.block_number)
                .chain(resolved.iter().map(|tx| tx.block_number))
                .collect();
            needs_timestamp.sort_unstable();
            needs_timestamp.dedup();
            self.ctx.resolve_timestamps(&needs_timestamp, reader).await;

            for tx in resolved.iter_mut() {
                tx.timestamp = self.ctx.cached_timestamp(tx.block_number);
            }
            let created = resolved.transform_transactions(&mut self.ctx);
            self.checkpoint.absorb_transactions(&created);

            let window = paginator.last_window();
            let block_range = window.or_else(|| block_span(logs.iter().map(|log| log.block_number)));
            let outcome = logs.transform_logs(&mut self.ctx, self.chain.pool_size_mode);

            if self.chain.pool_size_mode == PoolSizeMode::Polled {
                if let Some((_, to)) = block_range {
                    self.poll_pool_size(to, reader).await;
                }
            }

            let events = self.ctx.drain_dirty();
            self.checkpoint.refresh_transactions(&events);
            self.publisher
                .publish_page(PageLabel::Logs, &events, &outcome.payloads, block_range)
                .await;

            if let Some((_, to)) = window {
                self.checkpoint.observe_block(to);
            }
            if let (Some(metrics), Some((_, to))) = (&self.metrics, block_range) {
                metrics.record_block(to);
            }

            if reached_floor {
                info!("Reached previously indexed blocks, log phase complete");
                paginator.stop();
                Checkpoint::advance(&mut self.checkpoint.logs, None);
            } else {
                Checkpoint::advance(&mut self.checkpoint.logs, paginator.cursor());
            }
            self.stash_snapshots();
            self.save_checkpoint().await;

            if reached_floor {
                break Ok(());
            }
            if self.is_stopping() {
                paginator.stop();
                break Ok(());
            }
        };

        self.tally(paginator.controller());
        if result.is_ok() && !self.stopping && paginator.cursor().is_none() {
            Checkpoint::advance(&mut self.checkpoint.logs, None);
            self.save_checkpoint().await;
        }
        result
    }

    async fn poll_pool_size<R: ChainReader>(&mut self, block_number: u64, reader: &R) {
        let size = match reader.pool_size(block_number).await {
            Ok(size) => size,
            Err(e) => {
                warn!("Failed to read pool size at block {}: {}", block_number, e);
                return;
            }
        };
        let pool_size = u64::try_from(size).unwrap_or(u64::MAX);
        self.ctx.resolve_timestamps(&[block_number], reader).await;
        let timestamp = self.ctx.cached_timestamp(block_number).unwrap_or_default();
        debug!("Pool size at block {}: {}", block_number, pool_size);
        self.ctx.push_snapshot(PrivacyPoolSnapshot::polled(
            self.chain.chain_id,
            block_number,
            pool_size,
            timestamp,
        ));
    }

    // Snapshots wait in the checkpoint until the log phase completes
    fn stash_snapshots(&mut self) {
        let snapshots = self.ctx.take_snapshots();
        self.checkpoint.pending_snapshots.extend(snapshots);
    }

    /// Publishes snapshots and aggregates, closes the pass if both phases finished, and
    /// returns the run's tallies.
    pub async fn finish(mut self) -> RunSummary {
        self.stash_snapshots();

        let logs_complete = self.checkpoint.logs == PhaseProgress::Complete;
        let publish_snapshots = match self.chain.pool_size_mode {
            // Derived ordinals need every root of the pass to be numbered in block order
            PoolSizeMode::Derived => logs_complete,
            PoolSizeMode::Polled => true,
        };
        if publish_snapshots && !self.checkpoint.pending_snapshots.is_empty() {
            let snapshots = match self.chain.pool_size_mode {
                PoolSizeMode::Derived => self.checkpoint.number_pending_snapshots(),
                PoolSizeMode::Polled => std::mem::take(&mut self.checkpoint.pending_snapshots),
            };
            self.publisher.publish_snapshots(&snapshots).await;
        } else if !self.checkpoint.pending_snapshots.is_empty() {
            info!(
                "Holding {} pool snapshots until the log phase completes",
                self.checkpoint.pending_snapshots.len()
            );
        }

        self.publisher
            .publish_aggregates(&self.checkpoint.solvers, &self.checkpoint.daily_stats)
            .await;

        self.checkpoint.finish_pass();
        self.save_checkpoint().await;

        let report = self.publisher.report().clone();
        let mut summary = self.ctx.summary.clone();
        summary.solvers = self.checkpoint.solvers.len();
        summary.daily_stats = self.checkpoint.daily_stats.len();
        summary.batches_published = report.batches_published;
        summary.batches_failed = report.batches_failed;
        self.publisher.log_report();
        summary
    }
}

fn block_span(blocks: impl Iterator<Item = u64>) -> Option<(u64, u64)> {
    blocks.fold(None, |span, block| match span {
        None => Some((block, block)),
        Some((lo, hi)) => Some((lo.min(block), hi.max(block))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_span() {
        assert_eq!(block_span([7u64, 3, 9].into_iter()), Some((3, 9)));
        assert_eq!(block_span(std::iter::empty()), None);
    }
}
