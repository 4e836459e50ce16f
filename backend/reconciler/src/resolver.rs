//! Event resolver — recovers ledger-assigned identifiers after creation.
//!
//! Event indexing is not guaranteed synchronous with inclusion.  The
//! resolver polls the confirmation's ledger for the creation event, retrying
//! a fixed number of times with a fixed delay (ordinary indexing lag), then
//! falls back to a deterministic view query (indexer outage).  If both fail,
//! the operation is reported as *possibly succeeded* — never assumed to have
//! failed outright, so money that moved stays visible to operators.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::errors::{EngineError, Result};
use crate::events::EventKind;
use crate::gateway::LedgerGateway;
use crate::types::Confirmation;

/// Bounded sequential retry — never a concurrent fan-out, so the ledger's
/// indexer is not hammered.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

/// Resolve the identifier created by a confirmed operation.
///
/// `fallback` must be a deterministic read that returns the just-created
/// identifier for this actor — e.g. "latest invoice id for this exporter".
/// Exactly-once submission guarantees its correctness as long as no other
/// creation by the same actor raced this one.
pub async fn resolve_created<G, F, Fut>(
    gateway: &G,
    confirmation: &Confirmation,
    kind: EventKind,
    policy: &RetryPolicy,
    fallback: F,
) -> Result<u64>
where
    G: LedgerGateway,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    debug_assert!(kind.is_creation(), "resolver is only for creation events");

    for attempt in 1..=policy.max_attempts {
        match gateway.events_in_ledger(confirmation.ledger).await {
            Ok(events) => {
                let id = events.iter().find_map(|e| {
                    (e.kind == kind && e.tx_hash == confirmation.tx_hash)
                        .then_some(e.entity_id)
                        .flatten()
                });
                if let Some(id) = id {
                    return Ok(id);
                }
                warn!(
                    "{} event for {} not indexed yet (attempt {attempt}/{})",
                    kind.as_str(),
                    confirmation.tx_hash,
                    policy.max_attempts
                );
            }
            Err(e) => {
                warn!(
                    "event log read failed for ledger {} (attempt {attempt}/{}): {e}",
                    confirmation.ledger, policy.max_attempts
                );
            }
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    info!(
        "falling back to deterministic query for {} after {} polls",
        confirmation.tx_hash, policy.max_attempts
    );
    match fallback().await {
        Ok(id) => Ok(id),
        Err(e) => {
            // Operator alert: the creation may have succeeded on-chain.
            error!(
                tx_hash = %confirmation.tx_hash,
                ledger = confirmation.ledger,
                event = kind.as_str(),
                "identifier resolution failed; operation possibly succeeded: {e}"
            );
            Err(EngineError::IdentifierResolutionFailed {
                tx_hash: confirmation.tx_hash.clone(),
                detail: format!("event not indexed and fallback failed: {e}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::gateway::{InMemoryLedger, Operation};
    use crate::session::{Role, SessionContext};

    const ADMIN: &str = "GADMIN";
    const EXPORTER: &str = "GEXPORTER";

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    async fn ledger_with_exporter() -> InMemoryLedger {
        let ledger = InMemoryLedger::with_admin(ADMIN);
        let admin = SessionContext::new(ADMIN);
        ledger
            .submit(
                &admin,
                Operation::GrantRole { address: EXPORTER.into(), role: Role::Exporter },
            )
            .await
            .unwrap();
        ledger
            .submit(&admin, Operation::VerifyExporter { exporter: EXPORTER.into() })
            .await
            .unwrap();
        ledger
    }

    async fn create_invoice(ledger: &InMemoryLedger) -> crate::types::Confirmation {
        ledger
            .submit(
                &SessionContext::new(EXPORTER),
                Operation::CreateInvoice {
                    exporter_company: "Acme Exports".into(),
                    importer_company: "Widget Imports".into(),
                    importer_contact: "ops@widget.example".into(),
                    shipping_amount: 12_500,
                    loan_amount: 10_000,
                    shipping_date: 2_000_000_000,
                    document_hash: "bafybeigdyrzt".into(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resolves_from_event_log_immediately() {
        let ledger = ledger_with_exporter().await;
        let conf = create_invoice(&ledger).await;

        let id = resolve_created(&ledger, &conf, EventKind::InvoiceCreated, &fast_policy(), || {
            async { panic!("fallback must not run") }
        })
        .await
        .unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn retries_absorb_indexing_lag() {
        let ledger = ledger_with_exporter().await;
        let conf = create_invoice(&ledger).await;

        // Event appears only on the 2nd poll.
        ledger.suppress_event_polls(1).await;

        let fallback_used = AtomicBool::new(false);
        let id = resolve_created(&ledger, &conf, EventKind::InvoiceCreated, &fast_policy(), || {
            fallback_used.store(true, Ordering::SeqCst);
            async { Ok(99) }
        })
        .await
        .unwrap();
        assert_eq!(id, 1);
        assert!(!fallback_used.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fallback_matches_direct_event_read() {
        let ledger = ledger_with_exporter().await;
        let conf = create_invoice(&ledger).await;

        // What a direct event read would have produced.
        let direct_id = ledger
            .events_in_ledger(conf.ledger)
            .await
            .unwrap()
            .iter()
            .find(|e| e.kind == EventKind::InvoiceCreated)
            .and_then(|e| e.entity_id)
            .unwrap();

        // Event never appears within the retry window.
        ledger.suppress_event_polls(10).await;

        let id = resolve_created(&ledger, &conf, EventKind::InvoiceCreated, &fast_policy(), || {
            async {
                // Single actor: the exporter's latest invoice is the one
                // just created.
                let ids = ledger.get_exporter_invoices(EXPORTER).await?;
                ids.last().copied().ok_or_else(|| {
                    EngineError::Decode("exporter has no invoices".to_string())
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(id, direct_id);
    }

    #[tokio::test]
    async fn failing_fallback_reports_possibly_succeeded() {
        let ledger = ledger_with_exporter().await;
        let conf = create_invoice(&ledger).await;
        ledger.suppress_event_polls(10).await;

        let err = resolve_created(&ledger, &conf, EventKind::InvoiceCreated, &fast_policy(), || {
            async { Err(EngineError::LedgerUnavailable("indexer down".to_string())) }
        })
        .await
        .unwrap_err();

        match err {
            EngineError::IdentifierResolutionFailed { tx_hash, .. } => {
                assert_eq!(tx_hash, conf.tx_hash);
            }
            other => panic!("expected IdentifierResolutionFailed, got {other:?}"),
        }
    }
}
