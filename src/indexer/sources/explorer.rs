use alloy_primitives::{Address, B256, Bytes};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use crate::indexer::sources::{Cursor, Page, PageSource, with_timeout};
use crate::metrics::Metrics;
use crate::models::datasets::logs::{DecodedParam, RawLogData};
use crate::models::datasets::transactions::RawTransactionData;
use crate::models::errors::SourceError;
use crate::utils::parse_quantity;

//////////////////////////////////// Wire format ///////////////////////////////////////
#[derive(Debug, Deserialize)]
struct ExplorerPage<T> {
    items: Vec<T>,
    next_page_params: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ExplorerAddress {
    hash: Address,
}

#[derive(Debug, Deserialize)]
struct ExplorerTransaction {
    hash: B256,
    #[serde(alias = "block")]
    block_number: Option<u64>,
    from: ExplorerAddress,
    value: Option<String>,
    gas_used: Option<String>,
    gas_price: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    method: Option<String>,
    raw_input: Option<Bytes>,
    decoded_input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ExplorerDecodedLog {
    method_call: Option<String>,
    #[serde(default)]
    parameters: Vec<DecodedParam>,
}

#[derive(Debug, Deserialize)]
struct ExplorerLog {
    transaction_hash: B256,
    block_number: u64,
    index: Option<u64>,
    #[serde(default)]
    topics: Vec<Option<B256>>,
    data: Option<Bytes>,
    decoded: Option<ExplorerDecodedLog>,
}

impl ExplorerTransaction {
    fn into_raw(self) -> Option<RawTransactionData> {
        // Pending transactions carry no block yet
        let block_number = self.block_number?;
        Some(RawTransactionData {
            tx_hash: self.hash,
            block_number,
            from_address: self.from.hash,
            value: self.value.as_deref().and_then(parse_quantity).unwrap_or_default(),
            gas_used: self
                .gas_used
                .as_deref()
                .and_then(|gas| gas.parse::<u64>().ok())
                .unwrap_or_default(),
            gas_price: self
                .gas_price
                .as_deref()
                .and_then(parse_quantity)
                .unwrap_or_default(),
            method: self.method,
            input: self.raw_input,
            decoded_input: self.decoded_input.filter(|value| !value.is_null()),
            timestamp: self.timestamp.map(|ts| ts.timestamp() as u64),
        })
    }
}

impl From<ExplorerLog> for RawLogData {
    fn from(log: ExplorerLog) -> Self {
        let (event_name, decoded) = match log.decoded {
            Some(decoded) => (decoded.method_call, Some(decoded.parameters)),
            None => (None, None),
        };
        RawLogData {
            tx_hash: log.transaction_hash,
            block_number: log.block_number,
            log_index: log.index,
            // The explorer pads unused topic slots with nulls
            topics: log.topics.into_iter().flatten().collect(),
            data: log.data.unwrap_or_default(),
            event_name,
            decoded,
            timestamp: None,
        }
    }
}

//////////////////////////////////// Client ////////////////////////////////////////////
pub struct ExplorerClient {
    client: reqwest::Client,
    base_url: Url,
    address: Address,
    timeout: Duration,
    metrics: Option<Metrics>,
}

impl ExplorerClient {
    pub fn new(
        api_url: &str,
        address: Address,
        timeout: Duration,
        metrics: Option<Metrics>,
    ) -> Result<Self, SourceError> {
        let base_url = Url::parse(api_url).map_err(|e| SourceError::Malformed {
            endpoint: api_url.to_string(),
            reason: e.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Http {
                endpoint: api_url.to_string(),
                source: e,
            })?;
        Ok(Self {
            client,
            base_url,
            address,
            timeout,
            metrics,
        })
    }

    pub fn transactions(&self) -> ExplorerTransactionSource<'_> {
        ExplorerTransactionSource { client: self }
    }

    pub fn logs(&self) -> ExplorerLogSource<'_> {
        ExplorerLogSource { client: self }
    }

    fn page_url(&self, listing: &str, cursor: &Cursor) -> Result<Url, SourceError> {
        let path = format!("api/v2/addresses/{}/{}", self.address, listing);
        let mut url = self.base_url.join(&path).map_err(|e| SourceError::Malformed {
            endpoint: path.clone(),
            reason: e.to_string(),
        })?;

        {
            let mut query = url.query_pairs_mut();
            if listing == "transactions" {
                query.append_pair("filter", "to");
            }
            if let Cursor::Token { params } = cursor {
                for (key, value) in params {
                    match value {
                        Value::Null => {}
                        Value::String(raw) => {
                            query.append_pair(key, raw);
                        }
                        other => {
                            query.append_pair(key, &other.to_string());
                        }
                    }
                }
            }
        }
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        listing: &str,
        cursor: &Cursor,
    ) -> Result<Page<T>, SourceError> {
        if matches!(cursor, Cursor::Range { .. }) {
            return Err(SourceError::Malformed {
                endpoint: listing.to_string(),
                reason: "explorer listings are not block-range paginated".to_string(),
            });
        }

        let url = self.page_url(listing, cursor)?;
        let endpoint = format!("explorer_{}", listing);
        debug!("Fetching {}", url);

        let start = Instant::now();
        if let Some(metrics) = &self.metrics {
            metrics.record_request(&endpoint);
        }

        let result = with_timeout(&endpoint, self.timeout, async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| SourceError::Http {
                    endpoint: endpoint.clone(),
                    source: e,
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::Status {
                    endpoint: endpoint.clone(),
                    status: status.as_u16(),
                });
            }

            response
                .json::<ExplorerPage<T>>()
                .await
                .map_err(|e| SourceError::Malformed {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })
        })
        .await;

        if let Some(metrics) = &self.metrics {
            metrics.record_latency(&endpoint, start.elapsed().as_secs_f64(), result.is_err());
        }

        let page = result?;
        let next = match page.next_page_params {
            Some(params) if !page.items.is_empty() && !params.is_empty() => {
                Some(Cursor::Token { params })
            }
            _ => None,
        };
        Ok(Page {
            items: page.items,
            next,
        })
    }
}

pub struct ExplorerTransactionSource<'a> {
    client: &'a ExplorerClient,
}

impl PageSource for ExplorerTransactionSource<'_> {
    type Item = RawTransactionData;

    fn name(&self) -> &str {
        "explorer transactions"
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<RawTransactionData>, SourceError> {
        let page = self
            .client
            .fetch::<ExplorerTransaction>("transactions", cursor)
            .await?;

        let total = page.items.len();
        let items: Vec<RawTransactionData> = page
            .items
            .into_iter()
            .filter_map(ExplorerTransaction::into_raw)
            .collect();
        if items.len() < total {
            warn!("Dropped {} pending transactions without a block", total - items.len());
        }

        Ok(Page {
            items,
            next: page.next,
        })
    }

    // The next cursor of an unreceived page is unknowable
    fn skip(&self, _cursor: &Cursor) -> Option<Cursor> {
        None
    }
}

pub struct ExplorerLogSource<'a> {
    client: &'a ExplorerClient,
}

impl PageSource for ExplorerLogSource<'_> {
    type Item = RawLogData;

    fn name(&self) -> &str {
        "explorer logs"
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<RawLogData>, SourceError> {
        let page = self.client.fetch::<ExplorerLog>("logs", cursor).await?;
        Ok(Page {
            items: page.items.into_iter().map(RawLogData::from).collect(),
            next: page.next,
        })
    }

    fn skip(&self, _cursor: &Cursor) -> Option<Cursor> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_transaction_page() {
        let body = json!({
            "items": [{
                "hash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
                "block_number": 101,
                "from": { "hash": "0x00000000000000000000000000000000000000a1" },
                "value": "10",
                "gas_used": "21000",
                "gas_price": "1000000000",
                "timestamp": "2024-03-01T12:00:00.000000Z",
                "method": "execute",
                "raw_input": "0x",
                "decoded_input": null
            }, {
                "hash": "0x00000000000000000000000000000000000000000000000000000000000000bb",
                "block_number": null,
                "from": { "hash": "0x00000000000000000000000000000000000000a1" }
            }],
            "next_page_params": { "block_number": 101, "index": 3, "items_count": 50 }
        });

        let page: ExplorerPage<ExplorerTransaction> = serde_json::from_value(body).unwrap();
        assert!(page.next_page_params.is_some());

        let raw: Vec<RawTransactionData> = page
            .items
            .into_iter()
            .filter_map(ExplorerTransaction::into_raw)
            .collect();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].block_number, 101);
        assert_eq!(raw[0].gas_used, 21_000);
        assert_eq!(raw[0].value.to_string(), "10");
        assert_eq!(raw[0].timestamp, Some(1_709_294_400));
        assert!(raw[0].decoded_input.is_none());
    }

    #[test]
    fn test_parse_log_with_null_topics() {
        let body = json!({
            "transaction_hash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "block_number": 7,
            "index": 2,
            "topics": [
                "0x1111111111111111111111111111111111111111111111111111111111111111",
                null,
                null,
                null
            ],
            "data": "0x",
            "decoded": {
                "method_call": "CommitmentTreeRootAdded(bytes32 root)",
                "parameters": [{ "name": "root", "type": "bytes32", "value": "0x22", "indexed": false }]
            }
        });

        let log: RawLogData = serde_json::from_value::<ExplorerLog>(body).unwrap().into();
        assert_eq!(log.topics.len(), 1);
        assert_eq!(log.log_index, Some(2));
        assert_eq!(
            log.event_name.as_deref(),
            Some("CommitmentTreeRootAdded(bytes32 root)")
        );
        assert_eq!(log.decoded.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_page_url_carries_cursor_params() {
        let client = ExplorerClient::new(
            "https://explorer.example/",
            Address::repeat_byte(0x01),
            Duration::from_secs(5),
            None,
        )
        .unwrap();

        let mut params = Map::new();
        params.insert("block_number".to_string(), json!(101));
        params.insert("hash".to_string(), json!("0xabc"));
        params.insert("fee".to_string(), Value::Null);

        let url = client
            .page_url("transactions", &Cursor::Token { params })
            .unwrap();
        let query = url.query().unwrap_or_default();
        assert!(url.path().ends_with("/transactions"));
        assert!(query.contains("filter=to"));
        assert!(query.contains("block_number=101"));
        assert!(query.contains("hash=0xabc"));
        assert!(!query.contains("fee"));
    }
}
