//! Proportional charge allocation with remainder redistribution
//!
//! Splits a fixed pool of named charge totals across weighted lines in
//! proportion to each line's share of the weight basis. Rounding happens
//! at each per-line share computation, and every withdrawal is clamped to
//! what remains in the shared bucket, so the sum of all per-line
//! allocations plus the final remaining bucket always equals the original
//! pool to the allocation's precision.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::debug;

use super::error::AllocationError;

/// Named charge totals shared across all lines in one allocation pass.
/// Withdrawals are clamped so a bucket never goes below zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeBucket {
    remaining: BTreeMap<String, Decimal>,
}

impl ChargeBucket {
    pub fn from_totals(totals: &BTreeMap<String, Decimal>) -> Self {
        Self {
            remaining: totals.clone(),
        }
    }

    pub fn remaining(&self, charge_code: &str) -> Decimal {
        self.remaining
            .get(charge_code)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn charge_codes(&self) -> Vec<String> {
        self.remaining.keys().cloned().collect()
    }

    /// Withdraw up to `amount`, returning what was actually taken. A
    /// computed share larger than the remainder takes only the remainder,
    /// guarding against cumulative rounding starving the last line.
    pub fn withdraw(&mut self, charge_code: &str, amount: Decimal) -> Decimal {
        let Some(remaining) = self.remaining.get_mut(charge_code) else {
            return Decimal::ZERO;
        };
        let taken = amount.min(*remaining).max(Decimal::ZERO);
        *remaining -= taken;
        taken
    }

    pub fn is_drained(&self) -> bool {
        self.remaining.values().all(|v| v.is_zero())
    }
}

/// A weighted target of allocation. Lines with an absent or zero weight
/// are left untouched rather than zero-filled, so callers can distinguish
/// "not applicable" from "allocated zero".
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationLine {
    pub line_no: u32,
    pub weight: Decimal,
    pub allocated: BTreeMap<String, Decimal>,
}

impl AllocationLine {
    pub fn new(line_no: u32, weight: Decimal) -> Self {
        Self {
            line_no,
            weight,
            allocated: BTreeMap::new(),
        }
    }

    pub fn eligible(&self) -> bool {
        self.weight > Decimal::ZERO
    }

    fn credit(&mut self, charge_code: &str, amount: Decimal) {
        *self
            .allocated
            .entry(charge_code.to_string())
            .or_insert(Decimal::ZERO) += amount;
    }
}

pub struct FinancialAllocator {
    precision: u32,
}

impl FinancialAllocator {
    pub fn new(precision: u32) -> Self {
        Self { precision }
    }

    /// One proportional pass. Each line's share of each charge is rounded
    /// at the line, then withdrawn from the shared bucket (clamped to the
    /// remainder). Returns the bucket holding whatever rounding left over.
    pub fn allocate(
        &self,
        totals: &BTreeMap<String, Decimal>,
        basis: Decimal,
        lines: &mut [AllocationLine],
    ) -> Result<ChargeBucket, AllocationError> {
        if basis <= Decimal::ZERO {
            return Err(AllocationError::ZeroBasis);
        }

        let mut bucket = ChargeBucket::from_totals(totals);
        for line in lines.iter_mut() {
            if !line.eligible() {
                continue;
            }
            for (charge_code, total) in totals {
                let share = (total * line.weight / basis)
                    .round_dp_with_strategy(self.precision, RoundingStrategy::MidpointAwayFromZero);
                let taken = bucket.withdraw(charge_code, share);
                if !taken.is_zero() {
                    line.credit(charge_code, taken);
                }
            }
        }
        Ok(bucket)
    }

    /// One redistribution attempt for whatever rounding left in the
    /// bucket: an even split by count across lines with a usable weight,
    /// then the final leftover handed out one smallest unit at a time to
    /// the first eligible lines in sequence order. Zero eligible lines is
    /// a loud failure; silently looping is the only alternative.
    pub fn distribute_remainder(
        &self,
        bucket: &mut ChargeBucket,
        lines: &mut [AllocationLine],
    ) -> Result<(), AllocationError> {
        let unit = Decimal::new(1, self.precision);

        for charge_code in bucket.charge_codes() {
            let remaining = bucket.remaining(&charge_code);
            if remaining.is_zero() {
                continue;
            }

            let eligible_count = lines.iter().filter(|l| l.eligible()).count();
            if eligible_count == 0 {
                return Err(AllocationError::NoEligibleLines { charge_code });
            }
            debug!(%charge_code, %remaining, eligible_count, "redistributing rounding remainder");

            // rounded toward zero so the even split can never overdraw
            let even = (remaining / Decimal::from(eligible_count as u64))
                .round_dp_with_strategy(self.precision, RoundingStrategy::ToZero);
            if !even.is_zero() {
                for line in lines.iter_mut().filter(|l| l.eligible()) {
                    let taken = bucket.withdraw(&charge_code, even);
                    if taken.is_zero() {
                        break;
                    }
                    line.credit(&charge_code, taken);
                }
            }

            // leftover cents, first eligible lines in order, single pass
            for line in lines.iter_mut().filter(|l| l.eligible()) {
                if bucket.remaining(&charge_code).is_zero() {
                    break;
                }
                let taken = bucket.withdraw(&charge_code, unit);
                if !taken.is_zero() {
                    line.credit(&charge_code, taken);
                }
            }
        }
        Ok(())
    }

    /// Both passes. Conservation holds afterwards: per charge code, the
    /// sum of line allocations plus the remaining bucket equals the
    /// original total.
    pub fn allocate_with_redistribution(
        &self,
        totals: &BTreeMap<String, Decimal>,
        basis: Decimal,
        lines: &mut [AllocationLine],
    ) -> Result<ChargeBucket, AllocationError> {
        let mut bucket = self.allocate(totals, basis, lines)?;
        self.distribute_remainder(&mut bucket, lines)?;
        Ok(bucket)
    }
}
