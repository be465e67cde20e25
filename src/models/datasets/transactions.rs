use alloy_primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};

use crate::models::datasets::NaturalKey;

////////////////////////////////////// Raw Data ////////////////////////////////////////
// Normalized from an explorer transaction listing or an RPC transaction + receipt pair
#[derive(Debug, Clone)]
pub struct RawTransactionData {
    pub tx_hash: B256,
    pub block_number: u64,
    pub from_address: Address,
    pub value: U256,
    pub gas_used: u64,
    pub gas_price: U256,
    pub method: Option<String>,
    pub input: Option<Bytes>,
    // Explorer-side decoding, when the provider already did it
    pub decoded_input: Option<serde_json::Value>,
    pub timestamp: Option<u64>,
}

/////////////////////////////////// Transformed Data ///////////////////////////////////
/// One transaction sent to the monitored contract. `tx_hash`, `block_number` and `chain_id`
/// are fixed at creation; only `decoded_input` is enriched afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub chain_id: u64,
    pub tx_hash: B256,
    pub block_number: u64,
    pub event_type: String,
    pub solver_address: Address,
    #[serde(with = "crate::utils::u256_decimal")]
    pub value_wei: U256,
    pub gas_used: u64,
    #[serde(with = "crate::utils::u256_decimal")]
    pub gas_price: U256,
    pub decoded_input: serde_json::Value,
    pub timestamp: u64,
}

impl NaturalKey for TransactionRecord {
    fn natural_key(&self) -> String {
        format!("tx_{}_{}", self.chain_id, self.tx_hash)
    }
}
