use alloy_primitives::{B256, Bytes, U256, hex};
use alloy_sol_types::{SolCall, SolEvent, SolValue};
use serde::Serialize;
use serde_json::{Value, json};
use std::str::FromStr;

use crate::indexer::abi;
use crate::models::datasets::logs::RawLogData;
use crate::models::datasets::payloads::PayloadKind;
use crate::models::errors::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EventKind {
    TransactionExecuted,
    CommitmentTreeRootAdded,
    ActionExecuted,
    ResourcePayload,
    DiscoveryPayload,
    ExternalPayload,
    ApplicationPayload,
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TransactionExecuted => "TransactionExecuted",
            EventKind::CommitmentTreeRootAdded => "CommitmentTreeRootAdded",
            EventKind::ActionExecuted => "ActionExecuted",
            EventKind::ResourcePayload => "ResourcePayload",
            EventKind::DiscoveryPayload => "DiscoveryPayload",
            EventKind::ExternalPayload => "ExternalPayload",
            EventKind::ApplicationPayload => "ApplicationPayload",
            EventKind::Unknown => "Unknown",
        }
    }

    pub fn payload_kind(&self) -> Option<PayloadKind> {
        match self {
            EventKind::ResourcePayload => Some(PayloadKind::Resource),
            EventKind::DiscoveryPayload => Some(PayloadKind::Discovery),
            EventKind::ExternalPayload => Some(PayloadKind::External),
            EventKind::ApplicationPayload => Some(PayloadKind::Application),
            _ => None,
        }
    }
}

// Static topic0 table. Anything not listed here classifies as Unknown.
const EVENT_SIGNATURES: [(B256, EventKind); 7] = [
    (abi::TransactionExecuted::SIGNATURE_HASH, EventKind::TransactionExecuted),
    (abi::CommitmentTreeRootAdded::SIGNATURE_HASH, EventKind::CommitmentTreeRootAdded),
    (abi::ActionExecuted::SIGNATURE_HASH, EventKind::ActionExecuted),
    (abi::ResourcePayload::SIGNATURE_HASH, EventKind::ResourcePayload),
    (abi::DiscoveryPayload::SIGNATURE_HASH, EventKind::DiscoveryPayload),
    (abi::ExternalPayload::SIGNATURE_HASH, EventKind::ExternalPayload),
    (abi::ApplicationPayload::SIGNATURE_HASH, EventKind::ApplicationPayload),
];

const WORD: usize = 32;

/// Outcome of any decode attempt. `Unrecognized` means there was nothing to decode
/// (unknown topic, foreign selector); `Failed` means the shape was known but the bytes were not.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeResult<T> {
    Decoded(T),
    Unrecognized,
    Failed(String),
}

impl<T> From<Result<T, DecodeError>> for DecodeResult<T> {
    fn from(result: Result<T, DecodeError>) -> Self {
        match result {
            Ok(value) => DecodeResult::Decoded(value),
            Err(e) => DecodeResult::Failed(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    TransactionExecuted {
        tags: Vec<B256>,
        logic_refs: Vec<B256>,
    },
    RootAdded {
        root: B256,
    },
    ActionExecuted {
        action_tree_root: B256,
        tag_count: U256,
    },
    Payload {
        kind: PayloadKind,
        tag: B256,
        index: U256,
        blob: Bytes,
    },
}

pub fn classify_topic(topic: &B256) -> EventKind {
    EVENT_SIGNATURES
        .iter()
        .find(|(signature, _)| signature == topic)
        .map(|(_, kind)| *kind)
        .unwrap_or(EventKind::Unknown)
}

/// Classifies a log by its topic0. Explorer logs without topics fall back to the decoded event name.
pub fn classify(log: &RawLogData) -> EventKind {
    if let Some(topic) = log.signature() {
        return classify_topic(topic);
    }

    let Some(name) = log.event_name.as_deref() else {
        return EventKind::Unknown;
    };
    let name = name.split('(').next().unwrap_or(name).trim();
    EVENT_SIGNATURES
        .iter()
        .map(|(_, kind)| *kind)
        .find(|kind| kind.as_str() == name)
        .unwrap_or(EventKind::Unknown)
}

pub fn decode(log: &RawLogData, kind: EventKind) -> DecodeResult<DecodedEvent> {
    match kind {
        EventKind::Unknown => DecodeResult::Unrecognized,
        EventKind::TransactionExecuted => decode_transaction_executed(log).into(),
        EventKind::CommitmentTreeRootAdded => decode_root_added(log).into(),
        EventKind::ActionExecuted => decode_action_executed(&log.data).into(),
        EventKind::ResourcePayload
        | EventKind::DiscoveryPayload
        | EventKind::ExternalPayload
        | EventKind::ApplicationPayload => match kind.payload_kind() {
            Some(payload_kind) => decode_payload(log, payload_kind).into(),
            None => DecodeResult::Unrecognized,
        },
    }
}

fn decode_transaction_executed(log: &RawLogData) -> Result<DecodedEvent, DecodeError> {
    abi::TransactionExecuted::decode_raw_log(log.topics.iter().copied(), &log.data)
        .map(|event| DecodedEvent::TransactionExecuted {
            tags: event.tags,
            logic_refs: event.logicRefs,
        })
        .map_err(DecodeError::from)
        .or_else(|_| -> Result<DecodedEvent, DecodeError> {
            Ok(DecodedEvent::TransactionExecuted {
                tags: param_b256_list(log, "tags")?,
                logic_refs: param_b256_list(log, "logicRefs")?,
            })
        })
}

fn decode_root_added(log: &RawLogData) -> Result<DecodedEvent, DecodeError> {
    let root = log
        .first_param()
        .ok_or_else(|| DecodeError::MissingParameter("root".to_string()))
        .and_then(|value| value_to_b256(value, "root"))
        .or_else(|_| word_at(&log.data, 0))?;
    Ok(DecodedEvent::RootAdded { root })
}

// Both fields are non-indexed, so they are always the first two data words
fn decode_action_executed(data: &[u8]) -> Result<DecodedEvent, DecodeError> {
    let action_tree_root = word_at(data, 0)?;
    let tag_count = U256::from_be_bytes(word_at(data, 1)?.0);
    Ok(DecodedEvent::ActionExecuted {
        action_tree_root,
        tag_count,
    })
}

fn decode_payload(log: &RawLogData, kind: PayloadKind) -> Result<DecodedEvent, DecodeError> {
    let tag = log
        .topics
        .get(1)
        .copied()
        .ok_or_else(|| DecodeError::MissingParameter("tag".to_string()))
        .or_else(|_| param_b256(log, "tag"))?;

    let (index, blob) = decoded_index_and_blob(log)
        .or_else(|_| <(U256, Bytes)>::abi_decode_params(&log.data).map_err(DecodeError::from))?;

    Ok(DecodedEvent::Payload {
        kind,
        tag,
        index,
        blob,
    })
}

fn decoded_index_and_blob(log: &RawLogData) -> Result<(U256, Bytes), DecodeError> {
    let index = log
        .param("index")
        .ok_or_else(|| DecodeError::MissingParameter("index".to_string()))
        .and_then(|value| value_to_u256(value, "index"))?;
    let blob = log
        .param("blob")
        .ok_or_else(|| DecodeError::MissingParameter("blob".to_string()))
        .and_then(|value| value_to_bytes(value, "blob"))?;
    Ok((index, blob))
}

/// Decodes raw transaction input for the `execute` entrypoint into the JSON blob stored on the
/// transaction record. Used when a source has transactions but no logs.
pub fn decode_call_input(input: &[u8]) -> DecodeResult<Value> {
    if input.len() < 4 {
        return DecodeResult::Unrecognized;
    }
    if !input.starts_with(&abi::executeCall::SELECTOR) {
        return DecodeResult::Unrecognized;
    }

    match abi::executeCall::abi_decode(input) {
        Ok(call) => DecodeResult::Decoded(actions_to_json(&call.transaction)),
        Err(e) => DecodeResult::Failed(DecodeError::from(e).to_string()),
    }
}

fn actions_to_json(transaction: &abi::Transaction) -> Value {
    let actions: Vec<Value> = transaction
        .actions
        .iter()
        .map(|action| {
            let tags: Vec<B256> = action
                .logicVerifierInputs
                .iter()
                .map(|input| input.tag)
                .collect();
            let nullifiers: Vec<B256> = action
                .complianceVerifierInputs
                .iter()
                .map(|input| input.consumedNullifier)
                .collect();
            let commitments: Vec<B256> = action
                .complianceVerifierInputs
                .iter()
                .map(|input| input.createdCommitment)
                .collect();
            let logic_refs: Vec<B256> = action
                .complianceVerifierInputs
                .iter()
                .flat_map(|input| [input.consumedLogicRef, input.createdLogicRef])
                .collect();
            json!({
                "tags": tags,
                "nullifiers": nullifiers,
                "commitments": commitments,
                "logic_refs": logic_refs,
            })
        })
        .collect();

    json!({
        "method": "execute",
        "action_count": actions.len(),
        "actions": actions,
    })
}

fn word_at(data: &[u8], index: usize) -> Result<B256, DecodeError> {
    let start = index * WORD;
    let end = start + WORD;
    data.get(start..end)
        .map(B256::from_slice)
        .ok_or(DecodeError::ShortData {
            expected: end,
            got: data.len(),
        })
}

fn param_b256(log: &RawLogData, name: &str) -> Result<B256, DecodeError> {
    let value = log
        .param(name)
        .ok_or_else(|| DecodeError::MissingParameter(name.to_string()))?;
    value_to_b256(value, name)
}

fn param_b256_list(log: &RawLogData, name: &str) -> Result<Vec<B256>, DecodeError> {
    let value = log
        .param(name)
        .ok_or_else(|| DecodeError::MissingParameter(name.to_string()))?;
    value
        .as_array()
        .ok_or_else(|| invalid(name, "expected an array"))?
        .iter()
        .map(|item| value_to_b256(item, name))
        .collect()
}

fn value_to_b256(value: &Value, name: &str) -> Result<B256, DecodeError> {
    let raw = value
        .as_str()
        .ok_or_else(|| invalid(name, "expected a hex string"))?;
    B256::from_str(raw).map_err(|e| invalid(name, e.to_string()))
}

fn value_to_u256(value: &Value, name: &str) -> Result<U256, DecodeError> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| invalid(name, "expected an unsigned integer")),
        Value::String(raw) => {
            crate::utils::parse_quantity(raw).ok_or_else(|| invalid(name, "expected a quantity"))
        }
        _ => Err(invalid(name, "expected a number or string")),
    }
}

fn value_to_bytes(value: &Value, name: &str) -> Result<Bytes, DecodeError> {
    let raw = value
        .as_str()
        .ok_or_else(|| invalid(name, "expected a hex string"))?;
    hex::decode(raw)
        .map(Bytes::from)
        .map_err(|e| invalid(name, e.to_string()))
}

fn invalid(name: &str, reason: impl Into<String>) -> DecodeError {
    DecodeError::InvalidParameter {
        name: name.to_string(),
        reason: reason.into(),
    }
}
