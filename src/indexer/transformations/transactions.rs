use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::indexer::decoder::{DecodeResult, EventKind, decode_call_input};
use crate::indexer::transformations::{ReconstructionContext, merge_json};
use crate::models::datasets::transactions::{RawTransactionData, TransactionRecord};

pub trait TransactionTransformer {
    /// Builds records for transactions not seen before in this run and returns them.
    fn transform_transactions(self, ctx: &mut ReconstructionContext) -> Vec<TransactionRecord>;
}

impl TransactionTransformer for Vec<RawTransactionData> {
    fn transform_transactions(self, ctx: &mut ReconstructionContext) -> Vec<TransactionRecord> {
        let mut created = Vec::new();

        for raw in self {
            if ctx.contains_transaction(&raw.tx_hash) {
                debug!("Skipping duplicate transaction {}", raw.tx_hash);
                continue;
            }

            let timestamp = match raw.timestamp.or_else(|| ctx.cached_timestamp(raw.block_number)) {
                Some(timestamp) => timestamp,
                None => {
                    ctx.summary.timestamp_failures += 1;
                    0
                }
            };

            let decoded_input = build_decoded_input(&raw, ctx);
            let record = TransactionRecord {
                chain_id: ctx.chain_id,
                tx_hash: raw.tx_hash,
                block_number: raw.block_number,
                event_type: EventKind::TransactionExecuted.as_str().to_string(),
                solver_address: raw.from_address,
                value_wei: raw.value,
                gas_used: raw.gas_used,
                gas_price: raw.gas_price,
                decoded_input,
                timestamp,
            };

            if ctx.insert_transaction(record.clone()) {
                created.push(record);
            }
        }

        created
    }
}

// Own call-data decoding wins; the explorer's decoding is the fallback; `{}` otherwise
fn build_decoded_input(raw: &RawTransactionData, ctx: &mut ReconstructionContext) -> Value {
    let mut decoded = match raw.input.as_ref().map(|input| decode_call_input(input)) {
        Some(DecodeResult::Decoded(value)) => value,
        Some(DecodeResult::Failed(reason)) => {
            warn!("Failed to decode input of {}: {}", raw.tx_hash, reason);
            ctx.count_decode_failure("call");
            json!({})
        }
        Some(DecodeResult::Unrecognized) | None => raw.decoded_input.clone().unwrap_or(json!({})),
    };

    if let Some(method) = &raw.method {
        if decoded.get("method").is_none() {
            merge_json(&mut decoded, json!({ "method": method }));
        }
    }
    decoded
}
