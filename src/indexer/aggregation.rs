//! Rollups over the reconstructed transaction set.
//!
//! Every function here is pure: the same input yields the same output, in the same order,
//! so a rerun republishes identical rows under identical keys.

use alloy_primitives::{Address, U256};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::debug;

use crate::models::datasets::aggregates::{DailyStat, SolverAggregate};
use crate::models::datasets::privacy::PrivacyPoolSnapshot;
use crate::models::datasets::transactions::TransactionRecord;
use crate::utils::unix_to_date;

/// Groups transactions by solver. The zero address is not a solver and is excluded.
pub fn compute_solver_aggregates<'a>(
    chain_id: u64,
    transactions: impl IntoIterator<Item = &'a TransactionRecord>,
) -> Vec<SolverAggregate> {
    let mut by_solver: BTreeMap<Address, SolverAggregate> = BTreeMap::new();

    for tx in transactions {
        if tx.solver_address == Address::ZERO {
            continue;
        }
        let entry = by_solver
            .entry(tx.solver_address)
            .or_insert_with(|| SolverAggregate {
                chain_id,
                address: tx.solver_address,
                tx_count: 0,
                total_gas_used: U256::ZERO,
                total_value_wei: U256::ZERO,
                last_seen: 0,
            });
        entry.tx_count += 1;
        entry.total_gas_used += U256::from(tx.gas_used);
        entry.total_value_wei += tx.value_wei;
        entry.last_seen = entry.last_seen.max(tx.timestamp);
    }

    by_solver.into_values().collect()
}

/// Groups transactions by the UTC date of their timestamp. A zero timestamp marks a failed
/// block lookup (already counted in `timestamp_failures`); those records join no day.
pub fn compute_daily_stats<'a>(
    chain_id: u64,
    transactions: impl IntoIterator<Item = &'a TransactionRecord>,
) -> Vec<DailyStat> {
    let mut by_day: BTreeMap<NaiveDate, DailyStat> = BTreeMap::new();

    for tx in transactions {
        if tx.timestamp == 0 {
            debug!("No timestamp for {}, leaving it out of daily stats", tx.tx_hash);
            continue;
        }
        let Some(date) = unix_to_date(tx.timestamp) else {
            continue;
        };
        let entry = by_day.entry(date).or_insert_with(|| DailyStat {
            chain_id,
            date,
            tx_count: 0,
            volume_wei: U256::ZERO,
            gas_used: 0,
        });
        entry.tx_count += 1;
        entry.volume_wei += tx.value_wei;
        entry.gas_used += u128::from(tx.gas_used);
    }

    by_day.into_values().collect()
}

/// Sorts snapshots by block and numbers them `offset + 1 ..= offset + N`.
/// Returns the last ordinal handed out (`offset` when there are no snapshots).
pub fn assign_pool_ordinals(snapshots: &mut [PrivacyPoolSnapshot], offset: u64) -> u64 {
    snapshots.sort_by(|a, b| {
        a.block_number
            .cmp(&b.block_number)
            .then_with(|| a.root_hash.cmp(&b.root_hash))
    });
    for (position, snapshot) in snapshots.iter_mut().enumerate() {
        snapshot.pool_size = offset + position as u64 + 1;
    }
    offset + snapshots.len() as u64
}

/// Folds this run's partial solver rollups into the ones published by earlier runs.
pub fn merge_solver_aggregates(
    previous: &[SolverAggregate],
    partial: &[SolverAggregate],
) -> Vec<SolverAggregate> {
    let mut merged: BTreeMap<Address, SolverAggregate> = previous
        .iter()
        .map(|aggregate| (aggregate.address, aggregate.clone()))
        .collect();

    for aggregate in partial {
        merged
            .entry(aggregate.address)
            .and_modify(|existing| {
                existing.tx_count += aggregate.tx_count;
                existing.total_gas_used += aggregate.total_gas_used;
                existing.total_value_wei += aggregate.total_value_wei;
                existing.last_seen = existing.last_seen.max(aggregate.last_seen);
            })
            .or_insert_with(|| aggregate.clone());
    }

    merged.into_values().collect()
}

pub fn merge_daily_stats(previous: &[DailyStat], partial: &[DailyStat]) -> Vec<DailyStat> {
    let mut merged: BTreeMap<NaiveDate, DailyStat> = previous
        .iter()
        .map(|stat| (stat.date, stat.clone()))
        .collect();

    for stat in partial {
        merged
            .entry(stat.date)
            .and_modify(|existing| {
                existing.tx_count += stat.tx_count;
                existing.volume_wei += stat.volume_wei;
                existing.gas_used += stat.gas_used;
            })
            .or_insert_with(|| stat.clone());
    }

    merged.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use serde_json::json;

    const DAY: u64 = 86_400;

    fn tx(hash: u8, block: u64, solver: Address, value: u64, timestamp: u64) -> TransactionRecord {
        TransactionRecord {
            chain_id: 1,
            tx_hash: B256::repeat_byte(hash),
            block_number: block,
            event_type: "TransactionExecuted".to_string(),
            solver_address: solver,
            value_wei: U256::from(value),
            gas_used: 100,
            gas_price: U256::from(1u64),
            decoded_input: json!({}),
            timestamp,
        }
    }

    fn scenario() -> (Address, Address, Vec<TransactionRecord>) {
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);
        let base = 19_700 * DAY;
        let txs = vec![
            tx(1, 100, a, 10, base + 10),
            tx(2, 101, a, 0, base + 20),
            tx(3, 102, b, 5, base + DAY + 5),
        ];
        (a, b, txs)
    }

    #[test]
    fn test_solver_aggregates_scenario() {
        let (a, b, txs) = scenario();
        let aggregates = compute_solver_aggregates(1, &txs);

        assert_eq!(aggregates.len(), 2);
        let solver_a = aggregates.iter().find(|s| s.address == a).unwrap();
        let solver_b = aggregates.iter().find(|s| s.address == b).unwrap();
        assert_eq!(solver_a.tx_count, 2);
        assert_eq!(solver_a.total_value_wei, U256::from(10u64));
        assert_eq!(solver_a.total_gas_used, U256::from(200u64));
        assert_eq!(solver_b.tx_count, 1);
        assert_eq!(solver_b.total_value_wei, U256::from(5u64));
    }

    #[test]
    fn test_zero_address_is_not_a_solver() {
        let txs = vec![tx(1, 1, Address::ZERO, 7, 0)];
        assert!(compute_solver_aggregates(1, &txs).is_empty());
    }

    #[test]
    fn test_daily_stats_group_by_utc_date() {
        let (_, _, txs) = scenario();
        let stats = compute_daily_stats(1, &txs);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].tx_count, 2);
        assert_eq!(stats[0].volume_wei, U256::from(10u64));
        assert_eq!(stats[0].gas_used, 200);
        assert_eq!(stats[1].tx_count, 1);
        assert!(stats[0].date < stats[1].date);
    }

    #[test]
    fn test_daily_stats_leave_out_unknown_timestamps() {
        let (a, _, mut txs) = scenario();
        txs.push(tx(4, 103, a, 9, 0));
        let stats = compute_daily_stats(1, &txs);

        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|stat| stat.date.to_string() != "1970-01-01"));
        assert_eq!(stats.iter().map(|stat| stat.tx_count).sum::<u64>(), 3);
        // Solver rollups still count it
        let solver_a = compute_solver_aggregates(1, &txs)
            .into_iter()
            .find(|s| s.address == a)
            .unwrap();
        assert_eq!(solver_a.tx_count, 3);
    }

    #[test]
    fn test_recomputation_is_deterministic() {
        let (_, _, mut txs) = scenario();
        let first = serde_json::to_vec(&compute_solver_aggregates(1, &txs)).unwrap();
        let first_daily = serde_json::to_vec(&compute_daily_stats(1, &txs)).unwrap();

        txs.reverse();
        let second = serde_json::to_vec(&compute_solver_aggregates(1, &txs)).unwrap();
        let second_daily = serde_json::to_vec(&compute_daily_stats(1, &txs)).unwrap();

        assert_eq!(first, second);
        assert_eq!(first_daily, second_daily);
    }

    #[test]
    fn test_pool_ordinals_are_gapless_and_increasing() {
        let mut snapshots: Vec<PrivacyPoolSnapshot> = [130u64, 100, 120, 110]
            .iter()
            .map(|block| PrivacyPoolSnapshot::from_root(1, *block, B256::repeat_byte(*block as u8), 0))
            .collect();

        let last = assign_pool_ordinals(&mut snapshots, 0);
        assert_eq!(last, 4);
        let blocks: Vec<u64> = snapshots.iter().map(|s| s.block_number).collect();
        let sizes: Vec<u64> = snapshots.iter().map(|s| s.pool_size).collect();
        assert_eq!(blocks, vec![100, 110, 120, 130]);
        assert_eq!(sizes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_pool_ordinals_continue_from_offset() {
        let mut snapshots = vec![PrivacyPoolSnapshot::from_root(1, 500, B256::ZERO, 0)];
        assert_eq!(assign_pool_ordinals(&mut snapshots, 4), 5);
        assert_eq!(snapshots[0].pool_size, 5);
        assert_eq!(assign_pool_ordinals(&mut [], 5), 5);
    }

    #[test]
    fn test_merge_with_previous_run() {
        let (a, b, txs) = scenario();
        let previous = compute_solver_aggregates(1, &txs[..2]);
        let partial = compute_solver_aggregates(1, &txs[2..]);
        let merged = merge_solver_aggregates(&previous, &partial);
        assert_eq!(merged, compute_solver_aggregates(1, &txs));
        assert!(merged.iter().any(|s| s.address == a));
        assert!(merged.iter().any(|s| s.address == b));

        let previous_daily = compute_daily_stats(1, &txs[..1]);
        let partial_daily = compute_daily_stats(1, &txs[1..]);
        assert_eq!(
            merge_daily_stats(&previous_daily, &partial_daily),
            compute_daily_stats(1, &txs)
        );
    }
}
