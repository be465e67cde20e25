pub mod explorer;
pub mod rpc;

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;

use crate::models::datasets::transactions::RawTransactionData;
use crate::models::errors::SourceError;

/// Uniform position in a paginated source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Cursor {
    /// First page of any source
    Start,
    /// Provider-supplied continuation parameters (explorer `next_page_params`)
    Token { params: Map<String, Value> },
    /// Inclusive block window
    Range { from: u64, to: u64 },
}

impl Cursor {
    pub fn block_range(&self) -> Option<(u64, u64)> {
        match self {
            Cursor::Range { from, to } => Some((*from, *to)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` once the source has no more pages.
    pub next: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }

    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// A finite paginated data source. A provider error is always an `Err`, never an empty page.
pub trait PageSource {
    type Item;

    fn name(&self) -> &str;

    fn fetch_page(
        &self,
        cursor: &Cursor,
    ) -> impl Future<Output = Result<Page<Self::Item>, SourceError>>;

    /// Cursor to continue from when the page at `cursor` is abandoned. `None` when the
    /// source cannot know what follows a page it never received.
    fn skip(&self, cursor: &Cursor) -> Option<Cursor>;

    /// Inclusive block window a cursor stands for, when the source pages by blocks.
    fn block_window(&self, cursor: &Cursor) -> Option<(u64, u64)> {
        cursor.block_range()
    }

    /// Completion percentage at `cursor`, when the source knows its extent.
    fn progress(&self, _cursor: &Cursor) -> Option<f64> {
        None
    }
}

/// Point lookups against the chain, used to fill gaps that paginated listings leave.
pub trait ChainReader {
    fn block_timestamp(&self, block_number: u64) -> impl Future<Output = Result<u64, SourceError>>;

    fn transaction(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<RawTransactionData>, SourceError>>;

    /// Live commitment count of the monitored contract at `block_number`.
    fn pool_size(&self, block_number: u64) -> impl Future<Output = Result<U256, SourceError>>;
}

/// Stand-in reader for deployments without an RPC endpoint.
pub struct NoChainReader;

impl ChainReader for NoChainReader {
    async fn block_timestamp(&self, _block_number: u64) -> Result<u64, SourceError> {
        Err(SourceError::Unavailable("block timestamps"))
    }

    async fn transaction(&self, _tx_hash: B256) -> Result<Option<RawTransactionData>, SourceError> {
        Err(SourceError::Unavailable("transaction lookups"))
    }

    async fn pool_size(&self, _block_number: u64) -> Result<U256, SourceError> {
        Err(SourceError::Unavailable("pool state"))
    }
}

pub(crate) async fn with_timeout<T, F>(
    endpoint: &str,
    timeout: Duration,
    request: F,
) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| SourceError::Timeout {
            endpoint: endpoint.to_string(),
            secs: timeout.as_secs(),
        })?
}

/// Next inclusive window after `to`, clamped to `head`. `None` once `head` is covered.
pub fn next_range(to: u64, range_size: u64, head: u64) -> Option<Cursor> {
    if to >= head {
        return None;
    }
    let from = to + 1;
    Some(Cursor::Range {
        from,
        to: (from + range_size - 1).min(head),
    })
}
