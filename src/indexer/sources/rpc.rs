use alloy_consensus::Transaction as _;
use alloy_eips::{BlockId, BlockNumberOrTag};
use alloy_network::TransactionResponse;
use alloy_primitives::{Address, B256, Bytes, TxKind, U256};
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{Filter, Log, TransactionInput, TransactionRequest};
use alloy_sol_types::{SolCall, SolValue};
use anyhow::{Result, anyhow};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use url::Url;

use crate::indexer::abi;
use crate::indexer::sources::{ChainReader, Cursor, Page, PageSource, next_range, with_timeout};
use crate::metrics::Metrics;
use crate::models::datasets::logs::RawLogData;
use crate::models::datasets::transactions::RawTransactionData;
use crate::models::errors::SourceError;
use crate::utils::retry::{RetryConfig, retry};

pub struct RpcClient {
    provider: DynProvider,
    address: Address,
    timeout: Duration,
    metrics: Option<Metrics>,
}

impl RpcClient {
    pub fn connect(
        rpc_url: &str,
        address: Address,
        timeout: Duration,
        metrics: Option<Metrics>,
    ) -> Result<Self> {
        let url: Url = rpc_url.parse()?;
        info!("RPC URL: {}", url);
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self {
            provider,
            address,
            timeout,
            metrics,
        })
    }

    async fn timed<T, F>(&self, method: &str, request: F) -> Result<T, SourceError>
    where
        F: Future<Output = Result<T, SourceError>>,
    {
        let start = Instant::now();
        if let Some(metrics) = &self.metrics {
            metrics.record_request(method);
        }

        let result = with_timeout(method, self.timeout, request).await;

        if let Some(metrics) = &self.metrics {
            metrics.record_latency(method, start.elapsed().as_secs_f64(), result.is_err());
        }
        if let Err(e) = &result {
            warn!("RPC call {} failed: {}", method, e);
        }
        result
    }

    pub async fn get_chain_id(&self) -> Result<u64> {
        let retry_config = RetryConfig::default();
        retry(
            || async {
                self.timed("eth_chainId", async {
                    self.provider.get_chain_id().await.map_err(SourceError::from)
                })
                .await
                .map_err(|e| anyhow!(e))
            },
            &retry_config,
            "get_chain_id",
        )
        .await
    }

    pub async fn get_latest_block_number(&self) -> Result<u64> {
        let retry_config = RetryConfig::default();
        retry(
            || async {
                self.timed("eth_blockNumber", async {
                    self.provider.get_block_number().await.map_err(SourceError::from)
                })
                .await
                .map_err(|e| anyhow!(e))
            },
            &retry_config,
            "get_latest_block_number",
        )
        .await
    }

    pub async fn get_logs(&self, from: u64, to: u64) -> Result<Vec<RawLogData>, SourceError> {
        let filter = Filter::new()
            .address(self.address)
            .from_block(BlockNumberOrTag::Number(from))
            .to_block(BlockNumberOrTag::Number(to));

        let logs = self
            .timed("eth_getLogs", async {
                self.provider.get_logs(&filter).await.map_err(SourceError::from)
            })
            .await?;

        Ok(logs.into_iter().filter_map(log_to_raw).collect())
    }

    /// Resolves the chain head once and returns a block-range source over `[start_block, head]`,
    /// where `head` is additionally capped by `end_block`.
    pub async fn log_source(
        &self,
        start_block: u64,
        end_block: Option<u64>,
        range_size: u64,
    ) -> Result<RpcLogSource<'_>> {
        let latest = self.get_latest_block_number().await?;
        let head = end_block.map_or(latest, |end| end.min(latest));
        info!(
            "Chain head: {} (scanning blocks {} to {} in windows of {})",
            latest, start_block, head, range_size
        );
        Ok(RpcLogSource {
            client: self,
            start_block,
            head,
            range_size,
        })
    }
}

fn log_to_raw(log: Log) -> Option<RawLogData> {
    if log.removed {
        return None;
    }
    Some(RawLogData {
        tx_hash: log.transaction_hash?,
        block_number: log.block_number?,
        log_index: log.log_index,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
        event_name: None,
        decoded: None,
        timestamp: log.block_timestamp,
    })
}

impl ChainReader for RpcClient {
    async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError> {
        let block = self
            .timed("eth_getBlockByNumber", async {
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await
                    .map_err(SourceError::from)
            })
            .await?
            .ok_or_else(|| SourceError::NotFound {
                what: "block",
                id: block_number.to_string(),
            })?;
        Ok(block.header.timestamp)
    }

    async fn transaction(&self, tx_hash: B256) -> Result<Option<RawTransactionData>, SourceError> {
        let Some(transaction) = self
            .timed("eth_getTransactionByHash", async {
                self.provider
                    .get_transaction_by_hash(tx_hash)
                    .await
                    .map_err(SourceError::from)
            })
            .await?
        else {
            return Ok(None);
        };

        let receipt = self
            .timed("eth_getTransactionReceipt", async {
                self.provider
                    .get_transaction_receipt(tx_hash)
                    .await
                    .map_err(SourceError::from)
            })
            .await?;

        let Some(block_number) = transaction.block_number else {
            return Ok(None);
        };
        let (gas_used, gas_price) = receipt
            .map(|receipt| (receipt.gas_used, U256::from(receipt.effective_gas_price)))
            .unwrap_or_default();

        Ok(Some(RawTransactionData {
            tx_hash,
            block_number,
            from_address: transaction.from(),
            value: transaction.value(),
            gas_used,
            gas_price,
            method: None,
            input: Some(transaction.input().clone()),
            decoded_input: None,
            timestamp: None,
        }))
    }

    async fn pool_size(&self, block_number: u64) -> Result<U256, SourceError> {
        let request = TransactionRequest {
            to: Some(TxKind::Call(self.address)),
            input: TransactionInput::new(Bytes::from(abi::commitmentCountCall {}.abi_encode())),
            ..Default::default()
        };

        let output = self
            .timed("eth_call", async {
                self.provider
                    .call(request)
                    .block(BlockId::number(block_number))
                    .await
                    .map_err(SourceError::from)
            })
            .await?;

        U256::abi_decode(&output).map_err(|e| SourceError::Malformed {
            endpoint: "eth_call".to_string(),
            reason: e.to_string(),
        })
    }
}

/// `eth_getLogs` over inclusive windows `[from, min(from + range_size - 1, head)]`.
pub struct RpcLogSource<'a> {
    client: &'a RpcClient,
    start_block: u64,
    head: u64,
    range_size: u64,
}

impl RpcLogSource<'_> {
    fn first_range(&self) -> Option<(u64, u64)> {
        range_window(self.start_block, self.range_size, self.head)
    }
}

/// First window starting at `start_block`, or `None` when `start_block` is past `head`.
pub fn range_window(start_block: u64, range_size: u64, head: u64) -> Option<(u64, u64)> {
    (start_block <= head).then(|| (start_block, (start_block + range_size - 1).min(head)))
}

pub fn range_progress(start_block: u64, to: u64, head: u64) -> f64 {
    let total = head.saturating_sub(start_block) + 1;
    let done = to.saturating_sub(start_block) + 1;
    (done.min(total) as f64 / total as f64) * 100.0
}

impl PageSource for RpcLogSource<'_> {
    type Item = RawLogData;

    fn name(&self) -> &str {
        "rpc logs"
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<RawLogData>, SourceError> {
        let (from, to) = match cursor {
            Cursor::Start => match self.first_range() {
                Some(range) => range,
                None => return Ok(Page::last(Vec::new())),
            },
            Cursor::Range { from, to } => (*from, *to),
            Cursor::Token { .. } => {
                return Err(SourceError::Malformed {
                    endpoint: "eth_getLogs".to_string(),
                    reason: "rpc logs are block-range paginated".to_string(),
                });
            }
        };

        let items = self.client.get_logs(from, to).await?;
        Ok(Page {
            items,
            next: next_range(to, self.range_size, self.head),
        })
    }

    fn skip(&self, cursor: &Cursor) -> Option<Cursor> {
        let to = match cursor {
            Cursor::Range { to, .. } => *to,
            _ => self.first_range()?.1,
        };
        next_range(to, self.range_size, self.head)
    }

    fn block_window(&self, cursor: &Cursor) -> Option<(u64, u64)> {
        match cursor {
            Cursor::Start => self.first_range(),
            _ => cursor.block_range(),
        }
    }

    fn progress(&self, cursor: &Cursor) -> Option<f64> {
        let (_, to) = self.block_window(cursor)?;
        Some(range_progress(self.start_block, to, self.head))
    }
}
