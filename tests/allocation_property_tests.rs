//! Property-based tests for the financial allocator
//!
//! These verify the conservation and no-negative-withdrawal invariants
//! across a wide range of randomly generated charge pools and line
//! weights, not just the handful of splits the unit tests pin down.

use std::collections::BTreeMap;

use proptest::prelude::*;
use rust_decimal::Decimal;
use trade_cascade::allocation::{AllocationLine, FinancialAllocator};

const PRECISION: u32 = 2;

/// Strategy for a currency-like charge total between 0.01 and 100000.00
fn charge_total_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..=10_000_000).prop_map(|cents| Decimal::new(cents, PRECISION))
}

/// Strategy for a pool of one to four named charge totals
fn totals_strategy() -> impl Strategy<Value = BTreeMap<String, Decimal>> {
    prop::collection::vec(charge_total_strategy(), 1..=4).prop_map(|amounts| {
        amounts
            .into_iter()
            .enumerate()
            .map(|(i, amount)| (format!("charge_{i}"), amount))
            .collect()
    })
}

/// Strategy for line weights, including zero weights (ineligible lines).
/// At least one line carries a positive weight.
fn weights_strategy() -> impl Strategy<Value = Vec<Decimal>> {
    prop::collection::vec(0u64..=5_000, 1..=8)
        .prop_filter("at least one line must have weight", |ws| {
            ws.iter().any(|w| *w > 0)
        })
        .prop_map(|ws| ws.into_iter().map(Decimal::from).collect())
}

proptest! {
    /// Conservation: per charge code, the sum of all line allocations
    /// plus whatever remains in the bucket equals the original total.
    #[test]
    fn allocation_conserves_every_charge_total(
        totals in totals_strategy(),
        weights in weights_strategy(),
    ) {
        let allocator = FinancialAllocator::new(PRECISION);
        let basis: Decimal = weights.iter().copied().sum();
        let mut lines: Vec<AllocationLine> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| AllocationLine::new(i as u32 + 1, *w))
            .collect();

        let bucket = allocator
            .allocate_with_redistribution(&totals, basis, &mut lines)
            .unwrap();

        for (code, total) in &totals {
            let allocated: Decimal = lines
                .iter()
                .map(|l| l.allocated.get(code).copied().unwrap_or(Decimal::ZERO))
                .sum();
            prop_assert_eq!(allocated + bucket.remaining(code), *total);
        }
    }

    /// No withdrawal ever drives a bucket below zero, even under very
    /// uneven weight splits.
    #[test]
    fn buckets_never_go_negative(
        totals in totals_strategy(),
        weights in weights_strategy(),
    ) {
        let allocator = FinancialAllocator::new(PRECISION);
        let basis: Decimal = weights.iter().copied().sum();
        let mut lines: Vec<AllocationLine> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| AllocationLine::new(i as u32 + 1, *w))
            .collect();

        let bucket = allocator
            .allocate_with_redistribution(&totals, basis, &mut lines)
            .unwrap();

        for code in totals.keys() {
            prop_assert!(bucket.remaining(code) >= Decimal::ZERO);
        }
        // every individual allocation is non-negative too
        for line in &lines {
            for amount in line.allocated.values() {
                prop_assert!(*amount >= Decimal::ZERO);
            }
        }
    }

    /// Zero-weight lines are left untouched, never zero-filled.
    #[test]
    fn zero_weight_lines_receive_nothing(
        totals in totals_strategy(),
        weights in weights_strategy(),
    ) {
        let allocator = FinancialAllocator::new(PRECISION);
        let basis: Decimal = weights.iter().copied().sum();
        let mut lines: Vec<AllocationLine> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| AllocationLine::new(i as u32 + 1, *w))
            .collect();

        allocator
            .allocate_with_redistribution(&totals, basis, &mut lines)
            .unwrap();

        for line in &lines {
            if line.weight.is_zero() {
                prop_assert!(line.allocated.is_empty());
            }
        }
    }
}
