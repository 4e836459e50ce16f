//! Canonical event types emitted by the financing contract.
//!
//! Every state-changing ledger operation emits one event whose leading topic
//! symbol identifies the kind.  The event resolver consumes the creation
//! events; the rest are decoded for completeness so unknown topics stand out
//! in logs.

use serde::{Deserialize, Serialize};

/// All recognised event kinds from the financing contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new invoice was minted (`inv_created` topic).
    InvoiceCreated,
    /// An admin approved a pending invoice (`inv_approved` topic).
    InvoiceApproved,
    /// An admin rejected a pending invoice (`inv_rejected` topic).
    InvoiceRejected,
    /// A new pool was created from approved invoices (`pool_created` topic).
    PoolCreated,
    /// An investor contributed to a pool (`invested` topic).
    Invested,
    /// An exporter withdrew available funds (`withdrawn` topic).
    FundsWithdrawn,
    /// An admin marked an importer payment received (`inv_paid` topic).
    InvoicePaid,
    /// Pool profits were distributed (`distributed` topic).
    ProfitsDistributed,
    /// An investor claimed their returns (`claimed` topic).
    ReturnsClaimed,
    /// An exporter identity was verified (`exp_verified` topic).
    ExporterVerified,
    /// A role was granted (`role_granted` topic).
    RoleGranted,
    /// An event from this contract that we don't recognise yet.
    Unknown,
}

impl EventKind {
    /// Parse the leading topic symbol into an [`EventKind`].
    pub fn from_topic(topic: &str) -> Self {
        match topic {
            "inv_created" => Self::InvoiceCreated,
            "inv_approved" => Self::InvoiceApproved,
            "inv_rejected" => Self::InvoiceRejected,
            "pool_created" => Self::PoolCreated,
            "invested" => Self::Invested,
            "withdrawn" => Self::FundsWithdrawn,
            "inv_paid" => Self::InvoicePaid,
            "distributed" => Self::ProfitsDistributed,
            "claimed" => Self::ReturnsClaimed,
            "exp_verified" => Self::ExporterVerified,
            "role_granted" => Self::RoleGranted,
            _ => Self::Unknown,
        }
    }

    /// Short identifier string, stable across releases.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceCreated => "invoice_created",
            Self::InvoiceApproved => "invoice_approved",
            Self::InvoiceRejected => "invoice_rejected",
            Self::PoolCreated => "pool_created",
            Self::Invested => "invested",
            Self::FundsWithdrawn => "funds_withdrawn",
            Self::InvoicePaid => "invoice_paid",
            Self::ProfitsDistributed => "profits_distributed",
            Self::ReturnsClaimed => "returns_claimed",
            Self::ExporterVerified => "exporter_verified",
            Self::RoleGranted => "role_granted",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this event announces a newly created entity whose
    /// ledger-assigned identifier must be recovered by the resolver.
    pub fn is_creation(&self) -> bool {
        matches!(self, Self::InvoiceCreated | Self::PoolCreated)
    }
}

/// A fully decoded contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub kind: EventKind,
    /// The invoice or pool id the event concerns, when present.
    pub entity_id: Option<u64>,
    /// Address that triggered the operation, when present.
    pub actor: Option<String>,
    /// Amount carried by the event, when present.
    pub amount: Option<i64>,
    /// Ledger sequence the event was recorded in.
    pub ledger: u64,
    /// Hash of the transaction that emitted the event.
    pub tx_hash: String,
    /// Unix timestamp of ledger close.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_from_topic() {
        assert_eq!(EventKind::from_topic("inv_created"), EventKind::InvoiceCreated);
        assert_eq!(EventKind::from_topic("inv_approved"), EventKind::InvoiceApproved);
        assert_eq!(EventKind::from_topic("inv_rejected"), EventKind::InvoiceRejected);
        assert_eq!(EventKind::from_topic("pool_created"), EventKind::PoolCreated);
        assert_eq!(EventKind::from_topic("invested"), EventKind::Invested);
        assert_eq!(EventKind::from_topic("withdrawn"), EventKind::FundsWithdrawn);
        assert_eq!(EventKind::from_topic("inv_paid"), EventKind::InvoicePaid);
        assert_eq!(EventKind::from_topic("distributed"), EventKind::ProfitsDistributed);
        assert_eq!(EventKind::from_topic("claimed"), EventKind::ReturnsClaimed);
        assert_eq!(EventKind::from_topic("exp_verified"), EventKind::ExporterVerified);
        assert_eq!(EventKind::from_topic("role_granted"), EventKind::RoleGranted);
        assert_eq!(EventKind::from_topic("something_else"), EventKind::Unknown);
    }

    #[test]
    fn creation_events() {
        assert!(EventKind::InvoiceCreated.is_creation());
        assert!(EventKind::PoolCreated.is_creation());
        assert!(!EventKind::Invested.is_creation());
        assert!(!EventKind::ProfitsDistributed.is_creation());
    }
}
