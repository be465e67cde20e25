use alloy_primitives::{B256, Bytes};
use serde::{Deserialize, Serialize};

////////////////////////////////////// Raw Data ////////////////////////////////////////
// Base struct shared by explorer logs and `eth_getLogs` results
#[derive(Debug, Clone)]
pub struct RawLogData {
    pub tx_hash: B256,
    pub block_number: u64,
    pub log_index: Option<u64>,
    pub topics: Vec<B256>,
    pub data: Bytes,
    // Only explorer sources supply an event name and decoded parameters
    pub event_name: Option<String>,
    pub decoded: Option<Vec<DecodedParam>>,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedParam {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub indexed: bool,
}

impl RawLogData {
    pub fn signature(&self) -> Option<&B256> {
        self.topics.first()
    }

    pub fn param(&self, name: &str) -> Option<&serde_json::Value> {
        self.decoded
            .as_ref()?
            .iter()
            .find(|param| param.name == name)
            .map(|param| &param.value)
    }

    pub fn first_param(&self) -> Option<&serde_json::Value> {
        self.decoded.as_ref()?.first().map(|param| &param.value)
    }
}
