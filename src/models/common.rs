use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

use crate::indexer::decoder::EventKind;
use crate::models::errors::ConfigError;

const DEFAULT_PAGE_DELAY_MS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RANGE_SIZE: u64 = 10_000;
const DEFAULT_MAX_BLOB_BYTES: usize = 500;
const DEFAULT_PUBLISH_BATCH_SIZE: usize = 30;
const MAX_RETRIES_LIMIT: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_name: String,
    pub chain_id: u64,
    pub contract_address: String,
    #[serde(default)]
    pub start_block: u64,
    pub end_block: Option<u64>,
    pub source: SourceConfig,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub pool_size_mode: PoolSizeMode,
    #[serde(default = "default_max_blob_bytes")]
    pub max_blob_bytes: usize,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub artifacts_dir: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
}

/// Where raw chain data comes from. Both shapes feed the same pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Explorer API with provider-supplied opaque cursors. The optional RPC endpoint
    /// backs block timestamp lookups and live pool polling.
    Explorer {
        api_url: String,
        rpc_url: Option<String>,
    },
    /// Raw JSON-RPC `eth_getLogs` over fixed-size block windows.
    Rpc {
        rpc_url: String,
        #[serde(default = "default_range_size")]
        range_size: u64,
    },
}

impl SourceConfig {
    pub fn rpc_url(&self) -> Option<&str> {
        match self {
            SourceConfig::Explorer { rpc_url, .. } => rpc_url.as_deref(),
            SourceConfig::Rpc { rpc_url, .. } => Some(rpc_url.as_str()),
        }
    }

    /// Block window size for range-paged work. Explorer sources use it only for backfill.
    pub fn range_size(&self) -> u64 {
        match self {
            SourceConfig::Explorer { .. } => DEFAULT_RANGE_SIZE,
            SourceConfig::Rpc { range_size, .. } => *range_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Log the failed page, advance the cursor and keep going.
    #[default]
    Skip,
    /// Stop the run for this chain.
    Abort,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    #[serde(default)]
    pub jitter: bool,
    #[serde(default)]
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            multiplier: 2.5,
            jitter: false,
            on_exhausted: ExhaustionPolicy::Skip,
        }
    }
}

/// How privacy-pool sizes are obtained. Picked per deployment; the two are never mixed
/// within one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolSizeMode {
    /// Snapshots come from root-added events and are numbered 1..N by block. Synthetic.
    #[default]
    Derived,
    /// Pool size is read from live contract state at the end of each processed range.
    Polled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Fetch, reconstruct and push batches to `/api/admin/import`.
    #[default]
    Import,
    /// Delegate fetch-and-publish to the remote side via `/api/admin/backfill`.
    Backfill,
    /// Reconstruct only; artifacts on disk are the sole output.
    LocalOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub mode: PublishMode,
    pub api_url: Option<String>,
    pub admin_secret: Option<String>,
    #[serde(default = "default_secret_header")]
    pub secret_header: String,
    #[serde(default = "default_publish_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            mode: PublishMode::default(),
            api_url: None,
            admin_secret: None,
            secret_header: default_secret_header(),
            batch_size: DEFAULT_PUBLISH_BATCH_SIZE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

fn default_max_blob_bytes() -> usize {
    DEFAULT_MAX_BLOB_BYTES
}

fn default_page_delay_ms() -> u64 {
    DEFAULT_PAGE_DELAY_MS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_range_size() -> u64 {
    DEFAULT_RANGE_SIZE
}

fn default_secret_header() -> String {
    "x-admin-secret".to_string()
}

fn default_publish_batch_size() -> usize {
    DEFAULT_PUBLISH_BATCH_SIZE
}

impl ChainConfig {
    pub fn contract(&self) -> Result<Address, ConfigError> {
        self.contract_address
            .parse::<Address>()
            .map_err(|e| self.invalid("contract_address", e.to_string()))
    }

    fn invalid(&self, field: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidValue {
            chain: self.chain_name.clone(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    fn missing(&self, field: &str) -> ConfigError {
        ConfigError::MissingField {
            chain: self.chain_name.clone(),
            field: field.to_string(),
        }
    }

    pub fn validate(&self, publish: &PublishConfig) -> Result<(), ConfigError> {
        if self.chain_name.trim().is_empty() {
            return Err(self.missing("chain_name"));
        }
        if self.chain_id == 0 {
            return Err(self.missing("chain_id"));
        }
        self.contract()?;

        match &self.source {
            SourceConfig::Explorer { api_url, rpc_url } => {
                Url::parse(api_url).map_err(|e| self.invalid("source.api_url", e.to_string()))?;
                if let Some(rpc_url) = rpc_url {
                    Url::parse(rpc_url)
                        .map_err(|e| self.invalid("source.rpc_url", e.to_string()))?;
                }
            }
            SourceConfig::Rpc {
                rpc_url,
                range_size,
            } => {
                Url::parse(rpc_url).map_err(|e| self.invalid("source.rpc_url", e.to_string()))?;
                if *range_size == 0 {
                    return Err(self.invalid("source.range_size", "must be greater than zero"));
                }
            }
        }

        if let Some(end_block) = self.end_block {
            if end_block < self.start_block {
                return Err(self.invalid(
                    "end_block",
                    format!("{} is before start_block {}", end_block, self.start_block),
                ));
            }
        }

        if self.retry.max_retries > MAX_RETRIES_LIMIT {
            return Err(self.invalid(
                "retry.max_retries",
                format!("must be at most {}", MAX_RETRIES_LIMIT),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(self.invalid("retry.multiplier", "must be at least 1.0"));
        }

        if self.pool_size_mode == PoolSizeMode::Polled && self.source.rpc_url().is_none() {
            return Err(self.missing("source.rpc_url (required for polled pool size)"));
        }
        if publish.mode == PublishMode::Backfill && self.source.rpc_url().is_none() {
            return Err(self.missing("source.rpc_url (required to resolve the backfill head)"));
        }

        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chains.is_empty() {
            return Err(ConfigError::NoChains);
        }

        let publish = &self.publish;
        if matches!(publish.mode, PublishMode::Import | PublishMode::Backfill) {
            let api_url = publish.api_url.as_deref().ok_or(ConfigError::MissingField {
                chain: "*".to_string(),
                field: "publish.api_url".to_string(),
            })?;
            Url::parse(api_url).map_err(|e| ConfigError::InvalidValue {
                chain: "*".to_string(),
                field: "publish.api_url".to_string(),
                reason: e.to_string(),
            })?;
            if publish.admin_secret.as_deref().is_none_or(str::is_empty) {
                return Err(ConfigError::MissingField {
                    chain: "*".to_string(),
                    field: "publish.admin_secret (or INDEXER_ADMIN_SECRET)".to_string(),
                });
            }
        }
        if publish.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                chain: "*".to_string(),
                field: "publish.batch_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        for chain in &self.chains {
            chain.validate(publish)?;
        }
        Ok(())
    }
}

/// Per-run tallies shown to the operator and checked in tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub chain_id: u64,
    pub events_by_kind: BTreeMap<EventKind, u64>,
    pub unknown_events: u64,
    pub decode_failures: u64,
    pub call_decode_failures: u64,
    pub orphan_logs: u64,
    pub duplicate_payloads: u64,
    pub timestamp_failures: u64,
    pub pages_fetched: u64,
    pub pages_skipped: u64,
    pub retries: u64,
    pub transactions: usize,
    pub payloads: usize,
    pub privacy_snapshots: usize,
    pub solvers: usize,
    pub daily_stats: usize,
    pub batches_published: usize,
    pub batches_failed: usize,
    pub backfill_events_found: u64,
}
