//! Fuzzy matching of transactions to payment intents
//!
//! A transaction matches a pending intent when all of these hold:
//!
//! ```text
//! confirmed
//! received = sum of positive deltas for (merchant, token) > 0
//! |received - expected| <= max(expected * tolerance, absolute floor)
//! block_ms >= created_at - clock_skew
//! |block_ms - created_at| < match_window
//! signature not claimed by another intent
//! ```
//!
//! Candidates are tried in the order the source returned them (newest
//! first); the first one that settles wins.

use std::collections::HashMap;

use crate::config::OracleConfig;
use crate::payment::PaymentRecord;
use crate::source::ObservedTransaction;

/// Relative slack so amounts sitting exactly on a bound stay inclusive
/// despite float rounding (`1.05 - 1.0` is slightly above `0.05`).
const BOUND_EPSILON: f64 = 1e-9;

/// Check an observed amount against the expected one. Both bounds are
/// inclusive.
pub fn amount_within_tolerance(received: f64, expected: f64, config: &OracleConfig) -> bool {
    let tolerance = (expected * config.amount_tolerance).max(config.absolute_tolerance);
    (received - expected).abs() <= tolerance * (1.0 + BOUND_EPSILON)
}

/// Check a block time against the intent creation time
pub fn time_within_window(block_ms: i64, created_at: i64, config: &OracleConfig) -> bool {
    block_ms >= created_at - config.clock_skew_ms()
        && (block_ms - created_at).abs() < config.match_window_ms()
}

/// Amount a transaction pays toward `record`, if it matches at all
pub fn match_amount(
    record: &PaymentRecord,
    tx: &ObservedTransaction,
    config: &OracleConfig,
) -> Option<f64> {
    if !tx.confirmed {
        return None;
    }

    let block_ms = tx.block_time_ms()?;
    if !time_within_window(block_ms, record.created_at, config) {
        return None;
    }

    let received = tx.received_by(&record.merchant_address, record.mint());
    if received <= 0.0 || !amount_within_tolerance(received, record.expected_amount(), config) {
        return None;
    }

    Some(received)
}

/// Matching candidates for `record`, in source order.
///
/// `claims` maps signatures to the payment that holds them; signatures held
/// by another payment are skipped.
pub fn candidates<'a>(
    record: &'a PaymentRecord,
    transactions: &'a [ObservedTransaction],
    claims: &'a HashMap<String, String>,
    config: &'a OracleConfig,
) -> impl Iterator<Item = (&'a ObservedTransaction, f64)> + 'a {
    transactions
        .iter()
        .filter(move |tx| {
            claims
                .get(&tx.signature)
                .map_or(true, |owner| owner == &record.id)
        })
        .filter_map(move |tx| match_amount(record, tx, config).map(|amount| (tx, amount)))
}
