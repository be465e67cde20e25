pub mod logs;
pub mod transactions;

use alloy_primitives::{B256, Bytes};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::indexer::decoder::{EventKind, classify};
use crate::indexer::sources::ChainReader;
use crate::metrics::Metrics;
use crate::models::common::RunSummary;
use crate::models::datasets::logs::RawLogData;
use crate::models::datasets::payloads::PayloadKind;
use crate::models::datasets::privacy::PrivacyPoolSnapshot;
use crate::models::datasets::transactions::TransactionRecord;

/// Dedup and join state for a single run of a single chain.
///
/// Transactions are keyed by hash so logs can enrich them; payloads are keyed by
/// `(tx_hash, kind, index)`. Records touched since the last [`ReconstructionContext::drain_dirty`]
/// are the ones that still need publishing.
pub struct ReconstructionContext {
    pub chain_id: u64,
    pub max_blob_bytes: usize,
    pub summary: RunSummary,
    metrics: Option<Metrics>,
    transactions: HashMap<B256, TransactionRecord>,
    dirty: Vec<B256>,
    dirty_set: HashSet<B256>,
    payload_keys: HashSet<(B256, PayloadKind, u64)>,
    snapshots: Vec<PrivacyPoolSnapshot>,
    timestamps: BlockTimestampCache,
}

impl ReconstructionContext {
    pub fn new(chain_id: u64, max_blob_bytes: usize, metrics: Option<Metrics>) -> Self {
        Self {
            chain_id,
            max_blob_bytes,
            summary: RunSummary {
                chain_id,
                ..Default::default()
            },
            metrics,
            transactions: HashMap::new(),
            dirty: Vec::new(),
            dirty_set: HashSet::new(),
            payload_keys: HashSet::new(),
            snapshots: Vec::new(),
            timestamps: BlockTimestampCache::default(),
        }
    }

    pub fn contains_transaction(&self, tx_hash: &B256) -> bool {
        self.transactions.contains_key(tx_hash)
    }

    pub fn transaction(&self, tx_hash: &B256) -> Option<&TransactionRecord> {
        self.transactions.get(tx_hash)
    }

    pub(crate) fn insert_transaction(&mut self, record: TransactionRecord) -> bool {
        if self.transactions.contains_key(&record.tx_hash) {
            return false;
        }
        let tx_hash = record.tx_hash;
        self.timestamps.insert(record.block_number, record.timestamp);
        self.transactions.insert(tx_hash, record);
        self.summary.transactions += 1;
        self.mark_dirty(tx_hash);
        true
    }

    /// Reloads a record published earlier in the same pass. It is neither counted nor
    /// republished unless logs enrich it.
    pub fn restore_transaction(&mut self, record: TransactionRecord) {
        self.timestamps.insert(record.block_number, record.timestamp);
        self.transactions.entry(record.tx_hash).or_insert(record);
    }

    /// Merges `patch` into the stored record's decoded input. Returns `false` for unseen hashes.
    pub(crate) fn enrich_transaction(&mut self, tx_hash: &B256, patch: Value) -> bool {
        let Some(record) = self.transactions.get_mut(tx_hash) else {
            return false;
        };
        merge_json(&mut record.decoded_input, patch);
        self.mark_dirty(*tx_hash);
        true
    }

    fn mark_dirty(&mut self, tx_hash: B256) {
        if self.dirty_set.insert(tx_hash) {
            self.dirty.push(tx_hash);
        }
    }

    /// Takes the transactions created or enriched since the previous call.
    pub fn drain_dirty(&mut self) -> Vec<TransactionRecord> {
        self.dirty_set.clear();
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|tx_hash| self.transactions.get(&tx_hash).cloned())
            .collect()
    }

    pub(crate) fn insert_payload_key(&mut self, key: (B256, PayloadKind, u64)) -> bool {
        self.payload_keys.insert(key)
    }

    pub(crate) fn push_snapshot(&mut self, snapshot: PrivacyPoolSnapshot) {
        self.summary.privacy_snapshots += 1;
        self.snapshots.push(snapshot);
    }

    pub fn take_snapshots(&mut self) -> Vec<PrivacyPoolSnapshot> {
        std::mem::take(&mut self.snapshots)
    }

    pub fn cached_timestamp(&self, block_number: u64) -> Option<u64> {
        self.timestamps.get(block_number)
    }

    pub(crate) fn count_event(&mut self, kind: EventKind) {
        if kind == EventKind::Unknown {
            self.summary.unknown_events += 1;
            if let Some(metrics) = &self.metrics {
                metrics.record_unknown_event();
            }
            return;
        }
        *self.summary.events_by_kind.entry(kind).or_default() += 1;
        if let Some(metrics) = &self.metrics {
            metrics.record_event(kind.as_str());
        }
    }

    pub(crate) fn count_decode_failure(&mut self, what: &str) {
        match what {
            "call" => self.summary.call_decode_failures += 1,
            _ => self.summary.decode_failures += 1,
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_decode_failure(what);
        }
    }

    /// Hashes of primary-kind logs whose transaction has not been seen yet.
    pub fn unseen_primary_hashes(&self, logs: &[RawLogData]) -> Vec<B256> {
        let mut seen = HashSet::new();
        logs.iter()
            .filter(|log| classify(log) == EventKind::TransactionExecuted)
            .map(|log| log.tx_hash)
            .filter(|tx_hash| !self.transactions.contains_key(tx_hash))
            .filter(|tx_hash| seen.insert(*tx_hash))
            .collect()
    }

    /// Resolves the timestamp of every block in `blocks` that the cache does not hold yet.
    /// Each block number is queried at most once per run; failures are counted and cached as 0.
    pub async fn resolve_timestamps<R: ChainReader>(&mut self, blocks: &[u64], reader: &R) {
        for block_number in blocks {
            if self.timestamps.get(*block_number).is_some() {
                continue;
            }
            let timestamp = match reader.block_timestamp(*block_number).await {
                Ok(timestamp) => timestamp,
                Err(e) => {
                    debug!("No timestamp for block {}: {}", block_number, e);
                    self.summary.timestamp_failures += 1;
                    0
                }
            };
            self.timestamps.insert(*block_number, timestamp);
        }
    }
}

#[derive(Debug, Default)]
pub struct BlockTimestampCache {
    entries: HashMap<u64, u64>,
}

impl BlockTimestampCache {
    pub fn get(&self, block_number: u64) -> Option<u64> {
        self.entries.get(&block_number).copied()
    }

    // A known non-zero timestamp wins over a failed lookup
    pub fn insert(&mut self, block_number: u64, timestamp: u64) {
        let entry = self.entries.entry(block_number).or_insert(timestamp);
        if *entry == 0 {
            *entry = timestamp;
        }
    }
}

/// Shallow object merge; keys in `patch` overwrite. A non-object target is replaced.
pub fn merge_json(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                target.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Cuts `blob` to at most `max_bytes`. Lossy: the flag on the record is the only trace of the cut.
pub fn truncate_blob(blob: Bytes, max_bytes: usize) -> (Bytes, bool) {
    if blob.len() <= max_bytes {
        return (blob, false);
    }
    warn!("Truncating payload blob from {} to {} bytes", blob.len(), max_bytes);
    (Bytes(blob.0.slice(..max_bytes)), true)
}
