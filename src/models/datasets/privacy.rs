use alloy_primitives::B256;
use serde::{Deserialize, Serialize};

use crate::models::datasets::NaturalKey;

/// A point-in-time observation of the shielded commitment tree.
///
/// With `PoolSizeMode::Derived`, `pool_size` is a synthetic ordinal: the roots of each pass are
/// sorted by block and numbered after the previous pass's last ordinal, which yields a
/// monotonic growth curve but not an on-chain count. With `PoolSizeMode::Polled`, `pool_size` is the contract's reported commitment
/// count and `root_hash` carries a `polled_at_block_<n>` marker instead of a root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyPoolSnapshot {
    pub chain_id: u64,
    pub block_number: u64,
    pub root_hash: String,
    pub pool_size: u64,
    pub timestamp: u64,
}

impl PrivacyPoolSnapshot {
    /// Snapshot from a root-added event. `pool_size` stays 0 until ordinals are assigned.
    pub fn from_root(chain_id: u64, block_number: u64, root: B256, timestamp: u64) -> Self {
        Self {
            chain_id,
            block_number,
            root_hash: root.to_string(),
            pool_size: 0,
            timestamp,
        }
    }

    pub fn polled(chain_id: u64, block_number: u64, pool_size: u64, timestamp: u64) -> Self {
        Self {
            chain_id,
            block_number,
            root_hash: format!("polled_at_block_{}", block_number),
            pool_size,
            timestamp,
        }
    }
}

impl NaturalKey for PrivacyPoolSnapshot {
    fn natural_key(&self) -> String {
        format!("pool_{}_{}_{}", self.chain_id, self.block_number, self.root_hash)
    }
}
