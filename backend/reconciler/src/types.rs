//! Shared domain types.
//!
//! ## Status as a Finite-State Machine
//!
//! [`InvoiceStatus`] and [`PoolStatus`] are the canonical representations of
//! entity lifecycle state.  Each has exactly one stable string code per
//! variant ([`InvoiceStatus::as_str`]) used for storage and the wire; call
//! sites never compare against ad-hoc labels or numeric positions.
//!
//! ```text
//! Pending ──► Approved ──► InPool ──► Funded ──► Withdrawn ──► Paid ──► Completed
//!     └──► Rejected                      ▲            │
//!                                        └────────────┘  (partial withdrawals)
//! ```
//!
//! Transition legality lives in [`crate::lifecycle`]; these types only name
//! the states.
//!
//! All monetary amounts are `i64` in the ledger's smallest native unit.
//! Rates are basis points; shares are stored in basis points too.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a tokenized shipping invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    /// Submitted by the exporter, awaiting admin review.
    Pending,
    /// Approved by an admin; eligible for pooling.
    Approved,
    /// Admitted into a funding pool.
    InPool,
    /// The invoice's pool has crossed the funding threshold.
    Funded,
    /// The exporter has withdrawn part or all of the invested amount.
    Withdrawn,
    /// The importer's payment has been received.
    Paid,
    /// Pool profits distributed; terminal.
    Completed,
    /// Rejected by an admin; terminal.
    Rejected,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::InPool => "in_pool",
            Self::Funded => "funded",
            Self::Withdrawn => "withdrawn",
            Self::Paid => "paid",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "in_pool" => Some(Self::InPool),
            "funded" => Some(Self::Funded),
            "withdrawn" => Some(Self::Withdrawn),
            "paid" => Some(Self::Paid),
            "completed" => Some(Self::Completed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

/// Lifecycle status of a funding pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Created, not yet accepting investments.
    Open,
    /// Accepting investments, below the funding threshold.
    Fundraising,
    /// At or above the funding threshold but below 100%.
    PartiallyFunded,
    /// Fully funded; funds allocated to member invoices.
    Funded,
    /// Profits distributed, returns being claimed.
    Settling,
    /// All member invoices completed and returns claimed; terminal.
    Completed,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Fundraising => "fundraising",
            Self::PartiallyFunded => "partially_funded",
            Self::Funded => "funded",
            Self::Settling => "settling",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "fundraising" => Some(Self::Fundraising),
            "partially_funded" => Some(Self::PartiallyFunded),
            "funded" => Some(Self::Funded),
            "settling" => Some(Self::Settling),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Kinds of entities the off-chain store projects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Invoice,
    Pool,
    Investment,
    Payment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Pool => "pool",
            Self::Investment => "investment",
            Self::Payment => "payment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invoice" => Some(Self::Invoice),
            "pool" => Some(Self::Pool),
            "investment" => Some(Self::Investment),
            "payment" => Some(Self::Payment),
            _ => None,
        }
    }
}

/// Proof that a submitted operation was included and executed by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// Transaction hash assigned at submission.
    pub tx_hash: String,
    /// Ledger sequence at which the transaction was included.
    pub ledger: u64,
    /// Unix timestamp of ledger close.
    pub closed_at: i64,
}

/// Ledger-confirmed state of one shipping invoice.
///
/// Decoded once at the gateway boundary; downstream components never
/// re-interpret raw ledger tuples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: u64,
    pub exporter: String,
    pub exporter_company: String,
    pub importer_company: String,
    pub importer_contact: String,
    /// Value of the shipped goods.
    pub shipping_amount: i64,
    /// Requested financing; at most 80% of `shipping_amount`.
    pub loan_amount: i64,
    /// Cumulative funding allocated to this invoice.
    pub amount_invested: i64,
    /// Cumulative exporter withdrawals.
    pub amount_withdrawn: i64,
    /// Unix timestamp; must be in the future at creation.
    pub shipping_date: i64,
    pub created_at: i64,
    pub status: InvoiceStatus,
    /// Set exactly once, when the invoice is admitted into a pool.
    pub pool_id: Option<u64>,
    /// Content hash of supporting documents.  Opaque to the engine.
    pub document_hash: String,
}

/// Ledger-confirmed state of one funding pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub pool_id: u64,
    pub name: String,
    /// Member invoices, fixed at creation.
    pub invoice_ids: Vec<u64>,
    /// Sum of member invoices' `loan_amount` at creation.
    pub total_loan_amount: i64,
    /// Cumulative investor contributions.
    pub amount_invested: i64,
    /// Total paid out to investors, as reported by the ledger.
    pub amount_distributed: i64,
    /// Platform fee deducted at distribution.
    pub fee_paid: i64,
    pub start_date: i64,
    pub end_date: i64,
    pub status: PoolStatus,
}

/// One investor's cumulative position in one pool.
///
/// Keyed by `(pool_id, investor)` — repeat contributions grow this record,
/// they never create a second one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investment {
    pub pool_id: u64,
    pub investor: String,
    /// Cumulative contribution.
    pub amount: i64,
    /// Share of the pool in basis points, recomputed on each contribution.
    pub share_bps: i64,
    pub first_contribution_at: i64,
    pub last_contribution_at: i64,
    /// Monotonic false → true.
    pub returns_claimed: bool,
}

// ─────────────────────────────────────────────────────────
// Projection rows
// ─────────────────────────────────────────────────────────
//
// Rows as stored in / read from the off-chain store.  Every row carries the
// tx hash and ledger sequence of the confirmation that produced it, for
// auditability.

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub invoice_id: i64,
    pub exporter: String,
    pub exporter_company: String,
    pub importer_company: String,
    pub importer_contact: String,
    pub shipping_amount: i64,
    pub loan_amount: i64,
    pub amount_invested: i64,
    pub amount_withdrawn: i64,
    pub shipping_date: i64,
    pub created_at: i64,
    pub status: String,
    pub pool_id: Option<i64>,
    pub document_hash: String,
    pub tx_hash: String,
    pub ledger: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PoolRecord {
    pub pool_id: i64,
    pub name: String,
    /// JSON-encoded array of member invoice ids.
    pub invoice_ids: String,
    pub total_loan_amount: i64,
    pub amount_invested: i64,
    pub amount_distributed: i64,
    pub fee_paid: i64,
    pub start_date: i64,
    pub end_date: i64,
    pub status: String,
    pub tx_hash: String,
    pub ledger: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvestmentRecord {
    pub pool_id: i64,
    pub investor: String,
    pub amount: i64,
    pub share_bps: i64,
    pub first_contribution_at: i64,
    pub last_contribution_at: i64,
    pub returns_claimed: i64,
    pub tx_hash: String,
    pub ledger: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: i64,
    pub invoice_id: i64,
    pub amount: i64,
    pub tx_hash: String,
    pub ledger: i64,
    pub created_at: i64,
}
