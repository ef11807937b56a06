//! Invoice total derivation.
//!
//! Pure functions: no I/O, identical inputs always give identical totals.

use crate::models::{BillingPolicy, LineItem};
use rust_decimal::{Decimal, RoundingStrategy};

/// Description that marks a registration-fee row. Matched exactly.
pub const REGISTRATION_FEE_LABEL: &str = "Registration Fee";

pub fn is_registration_fee(item: &LineItem) -> bool {
    item.description == REGISTRATION_FEE_LABEL
}

/// Lesson count actually billed for `item` under `policy`.
///
/// Floored rows are raised to the minimum and rounded to whole lessons.
/// Registration fees and rows without an active floor bill the raw count.
pub fn billable_count(item: &LineItem, policy: &BillingPolicy) -> Decimal {
    match policy.lesson_floor() {
        Some(floor) if !is_registration_fee(item) => item
            .lesson_count
            .max(floor)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
        _ => item.lesson_count,
    }
}

pub fn line_total(item: &LineItem, policy: &BillingPolicy) -> Decimal {
    billable_count(item, policy) * item.rate
}

/// Invoice total: sum of line totals, rounded half-up to cents.
pub fn compute_total(items: &[LineItem], policy: &BillingPolicy) -> Decimal {
    items
        .iter()
        .map(|item| line_total(item, policy))
        .sum::<Decimal>()
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
