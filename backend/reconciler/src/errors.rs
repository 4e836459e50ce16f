//! Application-wide error types.
//!
//! The ledger-facing variants form a strict taxonomy:
//!
//! * [`EngineError::LedgerRejected`] — the ledger refused the operation
//!   (invariant violation, missing role).  Never retryable; the ledger's
//!   reason string is surfaced verbatim.
//! * [`EngineError::LedgerUnavailable`] — transient network/node failure.
//!   Retryable by the caller; the gateway itself never retries a submit.
//! * [`EngineError::IdentifierResolutionFailed`] — a creation may have
//!   succeeded on-chain but its new identifier could not be recovered.
//!   Reported as "possibly succeeded", never as a plain failure.
//! * [`EngineError::ProjectionWriteFailed`] — the off-chain cache write
//!   failed.  Non-fatal to the triggering operation; always compensated.
//! * [`EngineError::ReconciliationMismatch`] — computed distribution totals
//!   disagree with what the ledger reports.  Fatal to the distribution flow.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Ledger rejected {operation}: {reason}")]
    LedgerRejected {
        operation: &'static str,
        reason: String,
    },

    #[error("Ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("Could not resolve identifier created by tx {tx_hash}: {detail}")]
    IdentifierResolutionFailed { tx_hash: String, detail: String },

    #[error("Projection write failed for {target}: {detail}")]
    ProjectionWriteFailed { target: String, detail: String },

    #[error(
        "Distribution reconciliation mismatch: computed {computed}, ledger reported {reported}"
    )]
    ReconciliationMismatch { computed: i64, reported: i64 },

    #[error("Illegal {entity} transition {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Whether the caller may safely retry the whole operation.
    ///
    /// Only transient transport-level failures qualify.  A rejected ledger
    /// operation had no effect, and retrying it verbatim would fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LedgerUnavailable(_) | EngineError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
