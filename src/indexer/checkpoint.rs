use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::indexer::aggregation::{
    assign_pool_ordinals, compute_daily_stats, compute_solver_aggregates, merge_daily_stats,
    merge_solver_aggregates,
};
use crate::indexer::sources::{Cursor, Page, PageSource};
use crate::metrics::Metrics;
use crate::models::common::{ExhaustionPolicy, RetryPolicyConfig};
use crate::models::datasets::aggregates::{DailyStat, SolverAggregate};
use crate::models::datasets::NaturalKey;
use crate::models::datasets::privacy::PrivacyPoolSnapshot;
use crate::models::datasets::transactions::TransactionRecord;
use crate::utils::retry::RetryConfig;

//////////////////////////////////// Retry controller //////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    PageFetched,
    PageFailed { retries: u32 },
    Done,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Page accepted; continue with the next cursor.
    Advance,
    /// Terminal page accepted.
    Finish,
    /// Fetch the same page again after `delay`.
    Retry { attempt: u32, delay: Duration },
    /// Retries exhausted; move past the page.
    Skip,
    /// Retries exhausted; stop the run.
    Abort,
}

/// Bounded retry state machine driven by page outcomes.
///
/// | state                        | success (more) | success (last) | failure, retries < R | failure, retries = R |
/// |------------------------------|----------------|----------------|----------------------|----------------------|
/// | Running / PageFetched / PageFailed | PageFetched | Done        | PageFailed{retries+1}| Running (skip) / Aborted |
/// | Done / Aborted               | unchanged      | unchanged      | unchanged            | unchanged            |
#[derive(Debug, Clone)]
pub struct RetryController {
    state: RunState,
    max_retries: u32,
    on_exhausted: ExhaustionPolicy,
    backoff: RetryConfig,
    retries: u32,
    pub pages_fetched: u64,
    pub pages_skipped: u64,
    pub total_retries: u64,
}

impl RetryController {
    pub fn new(policy: &RetryPolicyConfig) -> Self {
        Self {
            state: RunState::Running,
            max_retries: policy.max_retries,
            on_exhausted: policy.on_exhausted,
            backoff: RetryConfig::from(policy),
            retries: 0,
            pages_fetched: 0,
            pages_skipped: 0,
            total_retries: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Consecutive failures of the current page.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, RunState::Done | RunState::Aborted)
    }

    pub fn on_success(&mut self, is_last: bool) -> Transition {
        if self.is_terminal() {
            return self.terminal_transition();
        }
        self.retries = 0;
        self.pages_fetched += 1;
        if is_last {
            self.state = RunState::Done;
            Transition::Finish
        } else {
            self.state = RunState::PageFetched;
            Transition::Advance
        }
    }

    pub fn on_failure(&mut self) -> Transition {
        if self.is_terminal() {
            return self.terminal_transition();
        }
        if self.retries < self.max_retries {
            self.retries += 1;
            self.total_retries += 1;
            self.state = RunState::PageFailed {
                retries: self.retries,
            };
            return Transition::Retry {
                attempt: self.retries,
                delay: self.backoff.delay_for(self.retries),
            };
        }

        self.retries = 0;
        match self.on_exhausted {
            ExhaustionPolicy::Skip => {
                self.pages_skipped += 1;
                self.state = RunState::Running;
                Transition::Skip
            }
            ExhaustionPolicy::Abort => {
                self.state = RunState::Aborted;
                Transition::Abort
            }
        }
    }

    /// Ends the run from outside (stop condition, shutdown, nothing left to skip to).
    pub fn finish(&mut self) {
        if !self.is_terminal() {
            self.state = RunState::Done;
        }
    }

    fn terminal_transition(&self) -> Transition {
        match self.state {
            RunState::Aborted => Transition::Abort,
            _ => Transition::Finish,
        }
    }
}

//////////////////////////////////// Paginator /////////////////////////////////////////

/// Walks a [`PageSource`] from a cursor to its terminal page under a [`RetryController`].
pub struct Paginator<'a, S: PageSource> {
    source: &'a S,
    controller: RetryController,
    cursor: Option<Cursor>,
    page_delay: Duration,
    delay_pending: bool,
    last_window: Option<(u64, u64)>,
    metrics: Option<Metrics>,
}

impl<'a, S: PageSource> Paginator<'a, S> {
    pub fn new(
        source: &'a S,
        policy: &RetryPolicyConfig,
        cursor: Cursor,
        page_delay: Duration,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            source,
            controller: RetryController::new(policy),
            cursor: Some(cursor),
            page_delay,
            delay_pending: false,
            last_window: None,
            metrics,
        }
    }

    /// Cursor of the next page to fetch. `None` once the source is exhausted.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Block window of the most recently returned page, for block-paged sources.
    pub fn last_window(&self) -> Option<(u64, u64)> {
        self.last_window
    }

    pub fn controller(&self) -> &RetryController {
        &self.controller
    }

    pub fn stop(&mut self) {
        self.controller.finish();
    }

    /// Next page, `Ok(None)` once done, `Err` when the exhaustion policy aborts.
    pub async fn next_page(&mut self) -> Result<Option<Page<S::Item>>> {
        loop {
            if matches!(self.controller.state(), RunState::Done) {
                return Ok(None);
            }
            let Some(cursor) = self.cursor.clone() else {
                self.controller.finish();
                return Ok(None);
            };

            if self.delay_pending {
                sleep(self.page_delay).await;
                self.delay_pending = false;
            }

            match self.source.fetch_page(&cursor).await {
                Ok(page) => {
                    self.controller.on_success(page.is_last());
                    self.delay_pending = true;
                    self.last_window = self.source.block_window(&cursor);

                    let progress = page
                        .next
                        .as_ref()
                        .map_or(Some(100.0), |_| self.source.progress(&cursor));
                    if let Some(metrics) = &self.metrics {
                        metrics.record_page(self.source.name(), progress);
                    }
                    match progress {
                        Some(percent) => info!(
                            "{}: page {} with {} items ({:.1}%)",
                            self.source.name(),
                            self.controller.pages_fetched,
                            page.items.len(),
                            percent
                        ),
                        None => info!(
                            "{}: page {} with {} items",
                            self.source.name(),
                            self.controller.pages_fetched,
                            page.items.len()
                        ),
                    }

                    self.cursor = page.next.clone();
                    return Ok(Some(page));
                }
                Err(e) => match self.controller.on_failure() {
                    Transition::Retry { attempt, delay } => {
                        warn!(
                            "{}: fetch failed ({}), retry {}/{} in {}ms",
                            self.source.name(),
                            e,
                            attempt,
                            self.controller.max_retries,
                            delay.as_millis()
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_page_failure(self.source.name(), true);
                        }
                        sleep(delay).await;
                    }
                    Transition::Skip => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_page_failure(self.source.name(), false);
                            metrics.record_skip(self.source.name());
                        }
                        match self.source.skip(&cursor) {
                            Some(next) => {
                                warn!(
                                    "{}: skipping page at {:?} after {} retries: {}",
                                    self.source.name(),
                                    cursor,
                                    self.controller.max_retries,
                                    e
                                );
                                self.cursor = Some(next);
                            }
                            None => {
                                warn!(
                                    "{}: page at {:?} failed after {} retries and has no successor, ending: {}",
                                    self.source.name(),
                                    cursor,
                                    self.controller.max_retries,
                                    e
                                );
                                self.cursor = None;
                                self.controller.finish();
                                return Ok(None);
                            }
                        }
                    }
                    Transition::Abort => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_page_failure(self.source.name(), false);
                        }
                        error!(
                            "{}: aborting at {:?} after {} retries: {}",
                            self.source.name(),
                            cursor,
                            self.controller.max_retries,
                            e
                        );
                        return Err(anyhow!(e).context(format!(
                            "{} aborted after {} retries",
                            self.source.name(),
                            self.controller.max_retries
                        )));
                    }
                    Transition::Advance | Transition::Finish => return Ok(None),
                },
            }
        }
    }
}

//////////////////////////////////// Checkpoint ////////////////////////////////////////

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "cursor", rename_all = "snake_case")]
pub enum PhaseProgress {
    #[default]
    NotStarted,
    InProgress(Cursor),
    Complete,
}

impl PhaseProgress {
    /// Where to (re)start this phase, or `None` when it already finished.
    pub fn resume_cursor(&self) -> Option<Cursor> {
        match self {
            PhaseProgress::NotStarted => Some(Cursor::Start),
            PhaseProgress::InProgress(cursor) => Some(cursor.clone()),
            PhaseProgress::Complete => None,
        }
    }
}

/// Durable per-chain progress. Saved after every page.
///
/// A pass runs the transaction phase and then the log phase. Once both are complete the
/// highest listed transaction block becomes `high_water_block`, and the next pass only takes
/// newer data. Until then `pass_transactions` holds the pass's records so a resumed run can
/// still join logs to transactions ingested before the interruption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub chain_id: u64,
    #[serde(default)]
    pub transactions: PhaseProgress,
    #[serde(default)]
    pub logs: PhaseProgress,
    #[serde(default)]
    pub high_water_block: u64,
    #[serde(default)]
    pub crawl_high_water: u64,
    #[serde(default)]
    pub solvers: Vec<SolverAggregate>,
    #[serde(default)]
    pub daily_stats: Vec<DailyStat>,
    #[serde(default)]
    pub last_pool_ordinal: u64,
    #[serde(default)]
    pub pending_snapshots: Vec<PrivacyPoolSnapshot>,
    // Natural key -> block of each root already given an ordinal above `high_water_block`
    #[serde(default)]
    pub numbered_roots: BTreeMap<String, u64>,
    #[serde(default)]
    pub pass_transactions: Vec<TransactionRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }

    pub fn pass_complete(&self) -> bool {
        self.transactions == PhaseProgress::Complete && self.logs == PhaseProgress::Complete
    }

    /// Starts a new incremental pass if the previous one finished.
    pub fn begin_pass(&mut self) {
        if self.pass_complete() {
            self.transactions = PhaseProgress::NotStarted;
            self.logs = PhaseProgress::NotStarted;
        }
    }

    pub fn observe_block(&mut self, block_number: u64) {
        self.crawl_high_water = self.crawl_high_water.max(block_number);
    }

    /// Records where a phase stands after a page; `next == None` completes it.
    pub fn advance(phase: &mut PhaseProgress, next: Option<&Cursor>) {
        *phase = match next {
            Some(cursor) => PhaseProgress::InProgress(cursor.clone()),
            None => PhaseProgress::Complete,
        };
    }

    pub fn finish_pass(&mut self) {
        if self.pass_complete() {
            self.high_water_block = self.high_water_block.max(self.crawl_high_water);
            let high_water = self.high_water_block;
            // Roots at or below the high water mark are never listed again
            self.numbered_roots.retain(|_, block| *block > high_water);
            self.pass_transactions.clear();
            info!(
                "Pass complete for chain {}; high water block is now {}",
                self.chain_id, self.high_water_block
            );
        }
    }

    /// Folds newly created transactions into the running aggregates.
    pub fn absorb_transactions(&mut self, records: &[TransactionRecord]) {
        if records.is_empty() {
            return;
        }
        let solvers = compute_solver_aggregates(self.chain_id, records);
        let daily = compute_daily_stats(self.chain_id, records);
        self.solvers = merge_solver_aggregates(&self.solvers, &solvers);
        self.daily_stats = merge_daily_stats(&self.daily_stats, &daily);
        for record in records {
            self.observe_block(record.block_number);
        }
        self.pass_transactions.extend(records.iter().cloned());
    }

    /// Replaces the stored copies of transactions that logs enriched.
    pub fn refresh_transactions(&mut self, records: &[TransactionRecord]) {
        for record in records {
            match self
                .pass_transactions
                .iter_mut()
                .find(|stored| stored.tx_hash == record.tx_hash)
            {
                Some(stored) => *stored = record.clone(),
                None => self.pass_transactions.push(record.clone()),
            }
        }
    }

    /// Takes the pending snapshots, drops roots numbered by an earlier pass and repeats,
    /// and numbers the rest after `last_pool_ordinal`.
    pub fn number_pending_snapshots(&mut self) -> Vec<PrivacyPoolSnapshot> {
        let mut fresh = Vec::new();
        for snapshot in std::mem::take(&mut self.pending_snapshots) {
            let key = snapshot.natural_key();
            if self.numbered_roots.contains_key(&key) {
                continue;
            }
            self.numbered_roots.insert(key, snapshot.block_number);
            fresh.push(snapshot);
        }
        self.last_pool_ordinal = assign_pool_ordinals(&mut fresh, self.last_pool_ordinal);
        fresh
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::errors::SourceError;
    use std::sync::Mutex;

    fn policy(max_retries: u32, on_exhausted: ExhaustionPolicy) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
            multiplier: 2.0,
            jitter: false,
            on_exhausted,
        }
    }

    #[test]
    fn test_k_failures_within_budget_succeed_and_reset() {
        let mut controller = RetryController::new(&policy(3, ExhaustionPolicy::Skip));
        for k in 1..=3 {
            assert!(matches!(
                controller.on_failure(),
                Transition::Retry { attempt, .. } if attempt == k
            ));
        }
        assert_eq!(controller.state(), RunState::PageFailed { retries: 3 });
        assert_eq!(controller.on_success(false), Transition::Advance);
        assert_eq!(controller.retries(), 0);
        assert_eq!(controller.state(), RunState::PageFetched);

        // The budget is per page again
        assert!(matches!(controller.on_failure(), Transition::Retry { attempt: 1, .. }));
    }

    #[test]
    fn test_exhaustion_skips_without_exceeding_budget() {
        let mut controller = RetryController::new(&policy(2, ExhaustionPolicy::Skip));
        let transitions: Vec<Transition> = (0..3).map(|_| controller.on_failure()).collect();
        assert!(matches!(transitions[0], Transition::Retry { attempt: 1, .. }));
        assert!(matches!(transitions[1], Transition::Retry { attempt: 2, .. }));
        assert_eq!(transitions[2], Transition::Skip);
        assert_eq!(controller.total_retries, 2);
        assert_eq!(controller.pages_skipped, 1);
        assert_eq!(controller.state(), RunState::Running);
    }

    #[test]
    fn test_exhaustion_aborts_and_stays_aborted() {
        let mut controller = RetryController::new(&policy(1, ExhaustionPolicy::Abort));
        assert!(matches!(controller.on_failure(), Transition::Retry { .. }));
        assert_eq!(controller.on_failure(), Transition::Abort);
        assert_eq!(controller.state(), RunState::Aborted);
        assert_eq!(controller.on_success(false), Transition::Abort);
        assert_eq!(controller.total_retries, 1);
    }

    #[test]
    fn test_last_page_finishes() {
        let mut controller = RetryController::new(&policy(3, ExhaustionPolicy::Skip));
        assert_eq!(controller.on_success(true), Transition::Finish);
        assert_eq!(controller.state(), RunState::Done);
    }

    /// Four pages of block ranges; fails `failures` times on the page starting at `flaky_from`.
    struct FlakySource {
        flaky_from: u64,
        failures: Mutex<u32>,
    }

    impl PageSource for FlakySource {
        type Item = u64;

        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<u64>, SourceError> {
            let (from, to) = cursor.block_range().unwrap_or((0, 9));
            if from == self.flaky_from {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(SourceError::Remote("boom".to_string()));
                }
            }
            Ok(Page {
                items: vec![from],
                next: crate::indexer::sources::next_range(to, 10, 39),
            })
        }

        fn skip(&self, cursor: &Cursor) -> Option<Cursor> {
            let (_, to) = cursor.block_range().unwrap_or((0, 9));
            crate::indexer::sources::next_range(to, 10, 39)
        }
    }

    async fn drain(source: &FlakySource, policy: &RetryPolicyConfig) -> (Vec<u64>, Result<()>) {
        let mut paginator = Paginator::new(source, policy, Cursor::Start, Duration::ZERO, None);
        let mut seen = Vec::new();
        loop {
            match paginator.next_page().await {
                Ok(Some(page)) => seen.extend(page.items),
                Ok(None) => return (seen, Ok(())),
                Err(e) => return (seen, Err(e)),
            }
        }
    }

    #[tokio::test]
    async fn test_paginator_recovers_within_budget() {
        let source = FlakySource {
            flaky_from: 20,
            failures: Mutex::new(3),
        };
        let (seen, result) = drain(&source, &policy(3, ExhaustionPolicy::Skip)).await;
        assert!(result.is_ok());
        assert_eq!(seen, vec![0, 10, 20, 30]);
    }

    #[tokio::test]
    async fn test_paginator_skips_exhausted_page() {
        let source = FlakySource {
            flaky_from: 20,
            failures: Mutex::new(4),
        };
        let (seen, result) = drain(&source, &policy(3, ExhaustionPolicy::Skip)).await;
        assert!(result.is_ok());
        assert_eq!(seen, vec![0, 10, 30]);
    }

    #[tokio::test]
    async fn test_paginator_aborts_exhausted_page() {
        let source = FlakySource {
            flaky_from: 20,
            failures: Mutex::new(4),
        };
        let (seen, result) = drain(&source, &policy(3, ExhaustionPolicy::Abort)).await;
        assert!(result.is_err());
        assert_eq!(seen, vec![0, 10]);
    }

    #[test]
    fn test_checkpoint_pass_lifecycle() {
        let mut checkpoint = Checkpoint::new(1);
        assert_eq!(checkpoint.transactions.resume_cursor(), Some(Cursor::Start));

        let next = Cursor::Range { from: 10, to: 19 };
        Checkpoint::advance(&mut checkpoint.transactions, Some(&next));
        assert_eq!(checkpoint.transactions.resume_cursor(), Some(next));

        Checkpoint::advance(&mut checkpoint.transactions, None);
        Checkpoint::advance(&mut checkpoint.logs, None);
        checkpoint.observe_block(42);
        checkpoint.finish_pass();
        assert_eq!(checkpoint.high_water_block, 42);

        checkpoint.begin_pass();
        assert_eq!(checkpoint.logs, PhaseProgress::NotStarted);

        let json = serde_json::to_string(&checkpoint).unwrap();
        assert_eq!(serde_json::from_str::<Checkpoint>(&json).unwrap(), checkpoint);
    }

    fn root(block: u64) -> PrivacyPoolSnapshot {
        PrivacyPoolSnapshot::from_root(1, block, alloy_primitives::B256::repeat_byte(block as u8), 0)
    }

    #[test]
    fn test_roots_seen_again_keep_their_ordinal() {
        let mut checkpoint = Checkpoint::new(1);
        checkpoint.pending_snapshots = vec![root(105), root(100), root(100)];
        let numbered = checkpoint.number_pending_snapshots();
        let ordinals: Vec<(u64, u64)> = numbered.iter().map(|s| (s.block_number, s.pool_size)).collect();
        assert_eq!(ordinals, vec![(100, 1), (105, 2)]);

        Checkpoint::advance(&mut checkpoint.transactions, None);
        Checkpoint::advance(&mut checkpoint.logs, None);
        checkpoint.observe_block(100);
        checkpoint.finish_pass();
        assert_eq!(checkpoint.numbered_roots.len(), 1);

        checkpoint.begin_pass();
        checkpoint.pending_snapshots = vec![root(105), root(110)];
        let numbered = checkpoint.number_pending_snapshots();
        assert_eq!(numbered.len(), 1);
        assert_eq!((numbered[0].block_number, numbered[0].pool_size), (110, 3));
        assert_eq!(checkpoint.last_pool_ordinal, 3);
    }

    #[test]
    fn test_pass_transactions_follow_enrichment_and_clear_on_completion() {
        let record = |value: serde_json::Value| TransactionRecord {
            chain_id: 1,
            tx_hash: alloy_primitives::B256::repeat_byte(2),
            block_number: 101,
            event_type: "TransactionExecuted".to_string(),
            solver_address: alloy_primitives::Address::repeat_byte(0xa),
            value_wei: alloy_primitives::U256::from(3u64),
            gas_used: 21_000,
            gas_price: alloy_primitives::U256::from(1u64),
            decoded_input: value,
            timestamp: 1_700_000_000,
        };
        let mut checkpoint = Checkpoint::new(1);
        checkpoint.absorb_transactions(&[record(serde_json::json!({}))]);
        checkpoint.refresh_transactions(&[record(serde_json::json!({ "tags": [] }))]);
        assert_eq!(checkpoint.pass_transactions.len(), 1);
        assert_eq!(checkpoint.pass_transactions[0].decoded_input["tags"], serde_json::json!([]));
        assert_eq!(checkpoint.solvers[0].tx_count, 1);

        // An unfinished pass keeps them
        checkpoint.finish_pass();
        assert_eq!(checkpoint.pass_transactions.len(), 1);

        Checkpoint::advance(&mut checkpoint.transactions, None);
        Checkpoint::advance(&mut checkpoint.logs, None);
        checkpoint.finish_pass();
        assert!(checkpoint.pass_transactions.is_empty());
    }
}
