//! Funding and distribution arithmetic.
//!
//! Pure functions over confirmed entity fields.  Nothing here is cached as
//! independently mutable state — callers recompute from the latest ledger
//! read, so derived figures cannot drift from on-chain truth.
//!
//! Threshold checks compare exact integer products; only the display
//! percentage is rounded.

use serde::Serialize;

use crate::errors::{EngineError, Result};
use crate::types::{Invoice, Investment};

/// Rounded pool funding percentage for display: `invested / total × 100`.
pub fn funding_percentage(amount_invested: i64, total_loan_amount: i64) -> i64 {
    if total_loan_amount <= 0 {
        return 0;
    }
    let scaled = amount_invested as i128 * 100 + total_loan_amount as i128 / 2;
    (scaled / total_loan_amount as i128) as i64
}

/// Exact threshold test — no rounding, so a pool at 69.99% never passes 70.
pub fn reached_threshold(amount_invested: i64, total_loan_amount: i64, threshold_pct: i64) -> bool {
    total_loan_amount > 0
        && amount_invested as i128 * 100 >= total_loan_amount as i128 * threshold_pct as i128
}

/// Amount the exporter may withdraw right now.
///
/// Zero until the invoice's pool reaches the funding threshold; from then on
/// the invested amount net of prior withdrawals, released progressively
/// rather than only at 100%.
pub fn withdrawable(
    invoice: &Invoice,
    pool_invested: i64,
    pool_total: i64,
    threshold_pct: i64,
) -> i64 {
    let capped = if reached_threshold(pool_invested, pool_total, threshold_pct) {
        invoice.amount_invested
    } else {
        0
    };
    (capped - invoice.amount_withdrawn).max(0)
}

/// Principal plus fixed-rate yield for one investor: `amount × (1 + rate)`.
pub fn investor_payout(amount: i64, rate_bps: i64) -> i64 {
    amount + (amount as i128 * rate_bps as i128 / 10_000) as i64
}

/// An investor's share of a pool in basis points.
pub fn share_bps(amount: i64, pool_invested: i64) -> i64 {
    if pool_invested <= 0 {
        return 0;
    }
    (amount as i128 * 10_000 / pool_invested as i128) as i64
}

/// USD-cent equivalent of a native amount, at the configured pinned price.
pub fn usd_equivalent_cents(amount: i64, native_price_usd_cents: i64) -> i64 {
    (amount as i128 * native_price_usd_cents as i128) as i64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payout {
    pub investor: String,
    pub amount: i64,
}

/// Compute per-investor payouts and assert they reconcile against the
/// ledger-reported distributed total.
///
/// The platform fee is deducted separately on-chain and is not part of
/// `reported_distributed`.  Any mismatch — even one unit — halts the
/// distribution flow; paying out against unreconciled figures is never
/// acceptable.
pub fn reconcile_distribution(
    investments: &[Investment],
    rate_bps: i64,
    reported_distributed: i64,
) -> Result<Vec<Payout>> {
    let payouts: Vec<Payout> = investments
        .iter()
        .map(|inv| Payout {
            investor: inv.investor.clone(),
            amount: investor_payout(inv.amount, rate_bps),
        })
        .collect();

    let computed: i64 = payouts.iter().map(|p| p.amount).sum();
    if computed != reported_distributed {
        return Err(EngineError::ReconciliationMismatch {
            computed,
            reported: reported_distributed,
        });
    }
    Ok(payouts)
}
