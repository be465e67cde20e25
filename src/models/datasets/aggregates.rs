use alloy_primitives::{Address, U256};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::datasets::NaturalKey;

/// Per-solver rollup, recomputed in full from the transaction set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverAggregate {
    pub chain_id: u64,
    pub address: Address,
    pub tx_count: u64,
    #[serde(with = "crate::utils::u256_decimal")]
    pub total_gas_used: U256,
    #[serde(with = "crate::utils::u256_decimal")]
    pub total_value_wei: U256,
    pub last_seen: u64,
}

/// Per-UTC-day rollup, recomputed in full from the transaction set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub chain_id: u64,
    pub date: NaiveDate,
    pub tx_count: u64,
    #[serde(with = "crate::utils::u256_decimal")]
    pub volume_wei: U256,
    pub gas_used: u128,
}

impl NaturalKey for SolverAggregate {
    fn natural_key(&self) -> String {
        format!("solver_{}_{}", self.chain_id, self.address)
    }
}

impl NaturalKey for DailyStat {
    fn natural_key(&self) -> String {
        format!("daily_{}_{}", self.chain_id, self.date)
    }
}
