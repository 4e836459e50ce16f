//! Lifecycle state machine for invoices and pools.
//!
//! A transition is only ever applied after the ledger gateway reports the
//! corresponding operation confirmed; nothing here permits optimistic
//! client-side transitions to become authoritative.  The projector calls
//! [`validate_invoice_transition`] / [`validate_pool_transition`] with the
//! last stored status and the freshly confirmed one before overwriting.
//!
//! The Funded ↔ Withdrawn pair is deliberately not single-pass: each partial
//! withdrawal keeps the invoice in `Withdrawn`, and the amount fields, not
//! the status, say how much remains.

use crate::errors::{EngineError, Result};
use crate::types::{Invoice, InvoiceStatus, Pool, PoolStatus};

/// Legal invoice transitions.  `from == to` is always allowed — re-projecting
/// a confirmed state is a no-op, not a transition.
///
/// Forward jumps are legal: a catch-up sync may read an invoice several
/// confirmed operations after the cache last saw it.  What is never legal is
/// moving backward, or crossing into or out of `Rejected` anywhere past
/// `Pending`.
pub fn invoice_transition_allowed(from: InvoiceStatus, to: InvoiceStatus) -> bool {
    use InvoiceStatus::*;
    if from == to {
        // Covers idempotent re-projection of any confirmed state, and the
        // Withdrawn → Withdrawn case of repeat partial withdrawals.
        return true;
    }
    fn rank(status: InvoiceStatus) -> Option<u8> {
        match status {
            Pending => Some(0),
            Approved => Some(1),
            InPool => Some(2),
            Funded => Some(3),
            Withdrawn => Some(4),
            Paid => Some(5),
            Completed => Some(6),
            Rejected => None,
        }
    }
    match (rank(from), rank(to)) {
        (Some(a), Some(b)) => b > a,
        _ => matches!((from, to), (Pending, Rejected)),
    }
}

pub fn validate_invoice_transition(from: InvoiceStatus, to: InvoiceStatus) -> Result<()> {
    if invoice_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition {
            entity: "invoice",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Legal pool transitions.
///
/// The funding phase is a monotonic ordering a single contribution may jump
/// forward within: one confirmed operation can carry a pool from `Open`
/// straight to `Funded`.  Settlement then advances one step at a time.
pub fn pool_transition_allowed(from: PoolStatus, to: PoolStatus) -> bool {
    use PoolStatus::*;
    if from == to {
        return true;
    }
    fn funding_rank(status: PoolStatus) -> Option<u8> {
        match status {
            Open => Some(0),
            Fundraising => Some(1),
            PartiallyFunded => Some(2),
            Funded => Some(3),
            Settling | Completed => None,
        }
    }
    match (funding_rank(from), funding_rank(to)) {
        (Some(a), Some(b)) => b > a,
        _ => matches!((from, to), (Funded, Settling) | (Settling, Completed)),
    }
}

pub fn validate_pool_transition(from: PoolStatus, to: PoolStatus) -> Result<()> {
    if pool_transition_allowed(from, to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition {
            entity: "pool",
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Field invariants that must hold for every confirmed invoice state.
///
/// These are ledger-enforced; a violation here means the ledger read was
/// decoded wrong and the projection must not be written.
pub fn check_invoice_invariants(inv: &Invoice) -> Result<()> {
    // loan_amount ≤ 0.8 × shipping_amount, in integer arithmetic
    if inv.loan_amount as i128 * 5 > inv.shipping_amount as i128 * 4 {
        return Err(EngineError::Invariant(format!(
            "invoice {}: loan_amount {} exceeds 80% of shipping_amount {}",
            inv.invoice_id, inv.loan_amount, inv.shipping_amount
        )));
    }
    if inv.amount_invested < 0 || inv.amount_invested > inv.loan_amount {
        return Err(EngineError::Invariant(format!(
            "invoice {}: amount_invested {} outside [0, {}]",
            inv.invoice_id, inv.amount_invested, inv.loan_amount
        )));
    }
    if inv.amount_withdrawn > inv.amount_invested {
        return Err(EngineError::Invariant(format!(
            "invoice {}: amount_withdrawn {} exceeds amount_invested {}",
            inv.invoice_id, inv.amount_withdrawn, inv.amount_invested
        )));
    }
    if inv.status != InvoiceStatus::Pending && inv.status != InvoiceStatus::Approved {
        // Any pooled status requires a pool association.
        if inv.status != InvoiceStatus::Rejected && inv.pool_id.is_none() {
            return Err(EngineError::Invariant(format!(
                "invoice {}: status {} without a pool_id",
                inv.invoice_id,
                inv.status.as_str()
            )));
        }
    }
    Ok(())
}

/// Field invariants that must hold for every confirmed pool state.
pub fn check_pool_invariants(pool: &Pool) -> Result<()> {
    if pool.amount_invested < 0 || pool.amount_invested > pool.total_loan_amount {
        return Err(EngineError::Invariant(format!(
            "pool {}: amount_invested {} outside [0, {}]",
            pool.pool_id, pool.amount_invested, pool.total_loan_amount
        )));
    }
    if pool.end_date <= pool.start_date {
        return Err(EngineError::Invariant(format!(
            "pool {}: end_date {} not after start_date {}",
            pool.pool_id, pool.end_date, pool.start_date
        )));
    }
    if pool.invoice_ids.is_empty() {
        return Err(EngineError::Invariant(format!(
            "pool {}: no member invoices",
            pool.pool_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use InvoiceStatus::*;

    fn invoice(status: InvoiceStatus) -> Invoice {
        Invoice {
            invoice_id: 1,
            exporter: "GEXPORTER".into(),
            exporter_company: "Acme Exports".into(),
            importer_company: "Widget Imports".into(),
            importer_contact: "ops@widget.example".into(),
            shipping_amount: 10_000,
            loan_amount: 8_000,
            amount_invested: 0,
            amount_withdrawn: 0,
            shipping_date: 2_000_000_000,
            created_at: 1_700_000_000,
            status,
            pool_id: if matches!(status, Pending | Approved | Rejected) {
                None
            } else {
                Some(7)
            },
            document_hash: "bafybeigdyrzt".into(),
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        for (from, to) in [
            (Pending, Approved),
            (Approved, InPool),
            (InPool, Funded),
            (Funded, Withdrawn),
            (Withdrawn, Paid),
            (Paid, Completed),
        ] {
            assert!(invoice_transition_allowed(from, to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn rejection_is_terminal() {
        assert!(invoice_transition_allowed(Pending, Rejected));
        for to in [Pending, Approved, InPool, Funded, Withdrawn, Paid, Completed] {
            assert!(!invoice_transition_allowed(Rejected, to));
        }
    }

    #[test]
    fn repeat_partial_withdrawals_keep_status() {
        assert!(invoice_transition_allowed(Withdrawn, Withdrawn));
    }

    #[test]
    fn catch_up_jumps_are_legal_but_backward_moves_are_not() {
        // A sync that missed intermediate operations still projects.
        assert!(invoice_transition_allowed(Pending, InPool));
        assert!(invoice_transition_allowed(Approved, Funded));
        assert!(invoice_transition_allowed(Funded, Completed));

        assert!(!invoice_transition_allowed(Approved, Pending));
        assert!(!invoice_transition_allowed(Completed, Withdrawn));
        assert!(!invoice_transition_allowed(Paid, Funded));
        assert!(!invoice_transition_allowed(Approved, Rejected));
    }

    #[test]
    fn pool_funding_phase_only_moves_forward() {
        assert!(pool_transition_allowed(PoolStatus::Fundraising, PoolStatus::Funded));
        assert!(pool_transition_allowed(PoolStatus::Open, PoolStatus::Funded));
        assert!(!pool_transition_allowed(
            PoolStatus::PartiallyFunded,
            PoolStatus::Fundraising
        ));
        assert!(!pool_transition_allowed(PoolStatus::Funded, PoolStatus::Open));
        assert!(!pool_transition_allowed(PoolStatus::Open, PoolStatus::Settling));
        assert!(!pool_transition_allowed(PoolStatus::Settling, PoolStatus::Funded));
        assert!(pool_transition_allowed(PoolStatus::Funded, PoolStatus::Settling));
        assert!(pool_transition_allowed(PoolStatus::Settling, PoolStatus::Completed));
    }

    #[test]
    fn loan_cap_invariant() {
        let mut inv = invoice(Pending);
        assert!(check_invoice_invariants(&inv).is_ok());

        inv.loan_amount = 8_001; // one unit over 80%
        assert!(matches!(
            check_invoice_invariants(&inv),
            Err(EngineError::Invariant(_))
        ));
    }

    #[test]
    fn withdrawn_cannot_exceed_invested() {
        let mut inv = invoice(Funded);
        inv.amount_invested = 5_000;
        inv.amount_withdrawn = 5_001;
        assert!(check_invoice_invariants(&inv).is_err());

        inv.amount_withdrawn = 5_000;
        assert!(check_invoice_invariants(&inv).is_ok());
    }

    #[test]
    fn pooled_status_requires_pool_id() {
        let mut inv = invoice(Funded);
        inv.pool_id = None;
        assert!(check_invoice_invariants(&inv).is_err());
    }

    #[test]
    fn pool_invariants() {
        let pool = Pool {
            pool_id: 7,
            name: "Q3 Electronics".into(),
            invoice_ids: vec![1, 2],
            total_loan_amount: 10_000,
            amount_invested: 10_001,
            amount_distributed: 0,
            fee_paid: 0,
            start_date: 100,
            end_date: 200,
            status: PoolStatus::Fundraising,
        };
        assert!(check_pool_invariants(&pool).is_err());

        let ok = Pool {
            amount_invested: 10_000,
            ..pool
        };
        assert!(check_pool_invariants(&ok).is_ok());
    }
}
