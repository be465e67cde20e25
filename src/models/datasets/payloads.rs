use alloy_primitives::{B256, Bytes};
use serde::{Deserialize, Serialize};

use crate::models::datasets::NaturalKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PayloadKind {
    Resource,
    Discovery,
    External,
    Application,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Resource => "Resource",
            PayloadKind::Discovery => "Discovery",
            PayloadKind::External => "External",
            PayloadKind::Application => "Application",
        }
    }
}

/// A payload fragment carried by a transaction. Unique on `(tx_hash, payload_type, payload_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRecord {
    pub chain_id: u64,
    pub tx_hash: B256,
    pub block_number: u64,
    pub payload_type: PayloadKind,
    pub payload_index: u64,
    pub tag: B256,
    pub blob: Bytes,
    // Set when `blob` was cut to the configured storage limit
    pub blob_truncated: bool,
    pub timestamp: u64,
}

impl NaturalKey for PayloadRecord {
    fn natural_key(&self) -> String {
        format!(
            "payload_{}_{}_{}_{}",
            self.chain_id,
            self.tx_hash,
            self.payload_type.as_str(),
            self.payload_index
        )
    }
}
