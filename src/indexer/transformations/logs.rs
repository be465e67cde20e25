use alloy_primitives::B256;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::indexer::decoder::{DecodeResult, DecodedEvent, EventKind, classify, decode};
use crate::indexer::transformations::{ReconstructionContext, truncate_blob};
use crate::models::common::PoolSizeMode;
use crate::models::datasets::logs::RawLogData;
use crate::models::datasets::payloads::PayloadRecord;
use crate::models::datasets::privacy::PrivacyPoolSnapshot;

#[derive(Debug, Default)]
pub struct LogOutcome {
    pub payloads: Vec<PayloadRecord>,
    pub enriched: usize,
    pub orphans: usize,
}

pub trait LogTransformer {
    /// Classifies and decodes every log, enriching known transactions and collecting payload
    /// rows. Root-added snapshots go to the context; only derived mode takes them from logs.
    fn transform_logs(self, ctx: &mut ReconstructionContext, pool_mode: PoolSizeMode) -> LogOutcome;
}

impl LogTransformer for Vec<RawLogData> {
    fn transform_logs(self, ctx: &mut ReconstructionContext, pool_mode: PoolSizeMode) -> LogOutcome {
        let mut outcome = LogOutcome::default();

        for log in self {
            let kind = classify(&log);
            ctx.count_event(kind);
            if kind == EventKind::Unknown {
                debug!(
                    "Unknown event {:?} in {}",
                    log.signature(),
                    log.tx_hash
                );
                continue;
            }

            let event = match decode(&log, kind) {
                DecodeResult::Decoded(event) => event,
                DecodeResult::Unrecognized => continue,
                DecodeResult::Failed(reason) => {
                    warn!("Failed to decode {} in {}: {}", kind.as_str(), log.tx_hash, reason);
                    ctx.count_decode_failure("log");
                    continue;
                }
            };

            let timestamp = log_timestamp(&log, ctx);

            match event {
                DecodedEvent::TransactionExecuted { tags, logic_refs } => {
                    let patch = json!({ "tags": tags, "logic_refs": logic_refs });
                    enrich(ctx, &mut outcome, &log.tx_hash, patch);
                }
                DecodedEvent::ActionExecuted {
                    action_tree_root,
                    tag_count,
                } => {
                    let mut actions = ctx
                        .transaction(&log.tx_hash)
                        .and_then(|record| record.decoded_input.get("executed_actions"))
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    actions.push(json!({
                        "action_tree_root": action_tree_root,
                        "tag_count": tag_count.to_string(),
                    }));
                    enrich(ctx, &mut outcome, &log.tx_hash, json!({ "executed_actions": actions }));
                }
                DecodedEvent::RootAdded { root } => {
                    if pool_mode == PoolSizeMode::Derived {
                        ctx.push_snapshot(PrivacyPoolSnapshot::from_root(
                            ctx.chain_id,
                            log.block_number,
                            root,
                            timestamp,
                        ));
                    }
                }
                DecodedEvent::Payload {
                    kind,
                    tag,
                    index,
                    blob,
                } => {
                    let Ok(payload_index) = u64::try_from(index) else {
                        warn!("Payload index {} out of range in {}", index, log.tx_hash);
                        ctx.count_decode_failure("log");
                        continue;
                    };
                    if !ctx.insert_payload_key((log.tx_hash, kind, payload_index)) {
                        ctx.summary.duplicate_payloads += 1;
                        continue;
                    }

                    let (blob, blob_truncated) = truncate_blob(blob, ctx.max_blob_bytes);
                    ctx.summary.payloads += 1;
                    outcome.payloads.push(PayloadRecord {
                        chain_id: ctx.chain_id,
                        tx_hash: log.tx_hash,
                        block_number: log.block_number,
                        payload_type: kind,
                        payload_index,
                        tag,
                        blob,
                        blob_truncated,
                        timestamp,
                    });
                }
            }
        }

        outcome
    }
}

// Orphans never fabricate a transaction record
fn enrich(ctx: &mut ReconstructionContext, outcome: &mut LogOutcome, tx_hash: &B256, patch: Value) {
    if ctx.enrich_transaction(tx_hash, patch) {
        outcome.enriched += 1;
    } else {
        debug!("Orphan log for unseen transaction {}", tx_hash);
        ctx.summary.orphan_logs += 1;
        outcome.orphans += 1;
    }
}

fn log_timestamp(log: &RawLogData, ctx: &mut ReconstructionContext) -> u64 {
    let known = log
        .timestamp
        .or_else(|| ctx.transaction(&log.tx_hash).map(|record| record.timestamp))
        .or_else(|| ctx.cached_timestamp(log.block_number));
    match known {
        Some(timestamp) => timestamp,
        None => {
            ctx.summary.timestamp_failures += 1;
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::abi;
    use crate::indexer::transformations::transactions::TransactionTransformer;
    use crate::models::datasets::payloads::PayloadKind;
    use crate::models::datasets::transactions::RawTransactionData;
    use alloy_primitives::{Address, Bytes, U256};
    use alloy_sol_types::SolEvent;

    fn log_from<E: SolEvent>(event: &E, tx: u8, block: u64) -> RawLogData {
        let data = event.encode_log_data();
        RawLogData {
            tx_hash: B256::repeat_byte(tx),
            block_number: block,
            log_index: Some(0),
            topics: data.topics().to_vec(),
            data: data.data.clone(),
            event_name: None,
            decoded: None,
            timestamp: Some(1_700_000_000),
        }
    }

    fn payload(tx: u8, index: u64, blob: Vec<u8>) -> RawLogData {
        log_from(
            &abi::ResourcePayload {
                tag: B256::repeat_byte(0x77),
                index: U256::from(index),
                blob: Bytes::from(blob),
            },
            tx,
            100,
        )
    }

    fn seed_transaction(ctx: &mut ReconstructionContext, tx: u8) {
        vec![RawTransactionData {
            tx_hash: B256::repeat_byte(tx),
            block_number: 100,
            from_address: Address::repeat_byte(0xa),
            value: U256::ZERO,
            gas_used: 0,
            gas_price: U256::ZERO,
            method: None,
            input: None,
            decoded_input: None,
            timestamp: Some(1_700_000_000),
        }]
        .transform_transactions(ctx);
    }

    #[test]
    fn test_primary_event_enriches_known_transaction() {
        let mut ctx = ReconstructionContext::new(1, 500, None);
        seed_transaction(&mut ctx, 1);
        ctx.drain_dirty();

        let log = log_from(
            &abi::TransactionExecuted {
                tags: vec![B256::repeat_byte(0x11)],
                logicRefs: vec![B256::repeat_byte(0x22)],
            },
            1,
            100,
        );
        let outcome = vec![log].transform_logs(&mut ctx, PoolSizeMode::Derived);
        assert_eq!(outcome.enriched, 1);

        let dirty = ctx.drain_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(
            dirty[0].decoded_input["tags"][0],
            json!(B256::repeat_byte(0x11))
        );
    }

    #[test]
    fn test_orphan_log_adds_payload_but_no_transaction() {
        let mut ctx = ReconstructionContext::new(1, 500, None);
        let primary = log_from(
            &abi::TransactionExecuted {
                tags: vec![],
                logicRefs: vec![],
            },
            9,
            100,
        );
        let outcome = vec![primary, payload(9, 0, vec![1, 2, 3])]
            .transform_logs(&mut ctx, PoolSizeMode::Derived);

        assert_eq!(outcome.orphans, 1);
        assert_eq!(outcome.payloads.len(), 1);
        assert!(!ctx.contains_transaction(&B256::repeat_byte(9)));
        assert_eq!(ctx.summary.orphan_logs, 1);
    }

    #[test]
    fn test_duplicate_payloads_are_dropped_and_blobs_truncated() {
        let mut ctx = ReconstructionContext::new(1, 4, None);
        let outcome = vec![
            payload(1, 0, vec![9; 10]),
            payload(1, 0, vec![9; 10]),
            payload(1, 1, vec![9; 2]),
        ]
        .transform_logs(&mut ctx, PoolSizeMode::Derived);

        assert_eq!(outcome.payloads.len(), 2);
        assert_eq!(ctx.summary.duplicate_payloads, 1);
        assert_eq!(outcome.payloads[0].payload_type, PayloadKind::Resource);
        assert!(outcome.payloads[0].blob_truncated);
        assert_eq!(outcome.payloads[0].blob.len(), 4);
        assert!(!outcome.payloads[1].blob_truncated);
    }

    #[test]
    fn test_unknown_topic_among_known_is_counted() {
        let mut ctx = ReconstructionContext::new(1, 500, None);
        let mut logs: Vec<RawLogData> = (0..9).map(|i| payload(1, i, vec![i as u8])).collect();
        let mut unknown = payload(1, 99, vec![]);
        unknown.topics[0] = B256::repeat_byte(0xee);
        logs.push(unknown);

        let outcome = logs.transform_logs(&mut ctx, PoolSizeMode::Derived);
        assert_eq!(ctx.summary.unknown_events, 1);
        assert_eq!(outcome.payloads.len(), 9);
        assert!(outcome.payloads.iter().all(|p| p.payload_index != 99));
    }

    #[test]
    fn test_root_snapshots_only_in_derived_mode() {
        let root = log_from(
            &abi::CommitmentTreeRootAdded {
                root: B256::repeat_byte(0x33),
            },
            1,
            120,
        );

        let mut derived = ReconstructionContext::new(1, 500, None);
        vec![root.clone()].transform_logs(&mut derived, PoolSizeMode::Derived);
        let snapshots = derived.take_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].block_number, 120);

        let mut polled = ReconstructionContext::new(1, 500, None);
        vec![root].transform_logs(&mut polled, PoolSizeMode::Polled);
        assert!(polled.take_snapshots().is_empty());
        assert_eq!(
            polled.summary.events_by_kind.get(&EventKind::CommitmentTreeRootAdded),
            Some(&1)
        );
    }
}
