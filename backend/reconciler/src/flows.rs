//! End-to-end operation flows.
//!
//! Every flow follows the same shape: submit through the gateway and block
//! for confirmation, recover any ledger-assigned identifier, re-read the
//! post-state from the ledger (never pre-call values plus a delta — another
//! actor may have intervened), then project into the off-chain store with
//! compensation on failure.  The caller always learns the ledger outcome
//! synchronously; cache lag is invisible to them and visible to operators
//! through the compensation backlog.
//!
//! Derived read helpers at the bottom compute from projections, not from
//! fresh ledger reads.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::calc::{self, Payout};
use crate::compensation::{self, Priority, TaskType};
use crate::config::Config;
use crate::db;
use crate::errors::{EngineError, Result};
use crate::events::EventKind;
use crate::gateway::{LedgerGateway, Operation};
use crate::projector::{self, Projection};
use crate::resolver::{self, RetryPolicy};
use crate::session::{Role, SessionContext};
use crate::types::{Confirmation, EntityKind, Pool};

#[derive(Debug, Clone)]
pub struct CreateInvoiceParams {
    pub exporter_company: String,
    pub importer_company: String,
    pub importer_contact: String,
    pub shipping_amount: i64,
    pub loan_amount: i64,
    pub shipping_date: i64,
    /// Content hash of the already-uploaded supporting documents.
    pub document_hash: String,
}

#[derive(Debug, Clone)]
pub struct CreatePoolParams {
    pub name: String,
    pub invoice_ids: Vec<u64>,
    pub start_date: i64,
    pub end_date: i64,
}

/// The reconciliation engine: one gateway, one store, one configuration.
pub struct Engine<G> {
    gateway: Arc<G>,
    db: SqlitePool,
    config: Config,
}

impl<G: LedgerGateway> Engine<G> {
    pub fn new(gateway: Arc<G>, db: SqlitePool, config: Config) -> Self {
        Self { gateway, db, config }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.resolver_max_attempts,
            Duration::from_millis(self.config.resolver_delay_ms),
        )
    }

    /// Tokenize a shipping invoice.  Returns the ledger-assigned id.
    ///
    /// If the confirmation's id cannot be recovered, the uploaded documents
    /// are scheduled for cleanup before the error propagates — the creation
    /// may still have succeeded on-chain, so nothing is assumed lost.
    pub async fn create_invoice(
        &self,
        session: &SessionContext,
        params: CreateInvoiceParams,
    ) -> Result<u64> {
        // Pre-check; the ledger enforces the cap authoritatively.
        if params.loan_amount as i128 * 5 > params.shipping_amount as i128 * 4 {
            return Err(EngineError::Invariant(format!(
                "loan_amount {} exceeds 80% of shipping_amount {}",
                params.loan_amount, params.shipping_amount
            )));
        }

        let document_hash = params.document_hash.clone();
        let conf = self
            .gateway
            .submit(
                session,
                Operation::CreateInvoice {
                    exporter_company: params.exporter_company,
                    importer_company: params.importer_company,
                    importer_contact: params.importer_contact,
                    shipping_amount: params.shipping_amount,
                    loan_amount: params.loan_amount,
                    shipping_date: params.shipping_date,
                    document_hash: params.document_hash,
                },
            )
            .await?;

        let exporter = session.address.clone();
        let resolved = resolver::resolve_created(
            self.gateway.as_ref(),
            &conf,
            EventKind::InvoiceCreated,
            &self.retry_policy(),
            || async {
                // Deterministic: the exporter's newest invoice is the one
                // this submission just created.
                let ids = self.gateway.get_exporter_invoices(&exporter).await?;
                ids.last().copied().ok_or_else(|| {
                    EngineError::Decode(format!("exporter {exporter} has no invoices"))
                })
            },
        )
        .await;

        let invoice_id = match resolved {
            Ok(id) => id,
            Err(e) => {
                // Don't leak the uploaded documents.
                if let Err(enqueue_err) = compensation::enqueue(
                    &self.db,
                    TaskType::IpfsCleanup,
                    EntityKind::Invoice,
                    0,
                    &json!({ "document_hash": document_hash, "tx_hash": conf.tx_hash }),
                    Priority::Low,
                )
                .await
                {
                    error!("could not schedule document cleanup: {enqueue_err}");
                }
                return Err(e);
            }
        };

        let invoice = self.gateway.get_invoice(invoice_id).await?;
        projector::project_or_compensate(&self.db, &Projection::Invoice(&invoice), &conf).await;
        info!(invoice_id, tx_hash = %conf.tx_hash, "invoice created");
        Ok(invoice_id)
    }

    pub async fn approve_invoice(
        &self,
        session: &SessionContext,
        invoice_id: u64,
    ) -> Result<Confirmation> {
        let conf = self
            .gateway
            .submit(session, Operation::ApproveInvoice { invoice_id })
            .await?;
        self.reproject_invoice(invoice_id, &conf).await;
        Ok(conf)
    }

    pub async fn reject_invoice(
        &self,
        session: &SessionContext,
        invoice_id: u64,
    ) -> Result<Confirmation> {
        let conf = self
            .gateway
            .submit(session, Operation::RejectInvoice { invoice_id })
            .await?;
        self.reproject_invoice(invoice_id, &conf).await;
        Ok(conf)
    }

    /// Group approved invoices into a funding pool.  Returns the pool id.
    pub async fn create_pool(
        &self,
        session: &SessionContext,
        params: CreatePoolParams,
    ) -> Result<u64> {
        let conf = self
            .gateway
            .submit(
                session,
                Operation::CreatePool {
                    name: params.name,
                    invoice_ids: params.invoice_ids,
                    start_date: params.start_date,
                    end_date: params.end_date,
                },
            )
            .await?;

        let pool_id = resolver::resolve_created(
            self.gateway.as_ref(),
            &conf,
            EventKind::PoolCreated,
            &self.retry_policy(),
            || async {
                let ids = self.gateway.get_all_open_pools().await?;
                ids.into_iter().max().ok_or_else(|| {
                    EngineError::Decode("no open pools after pool creation".to_string())
                })
            },
        )
        .await?;

        let pool = self.gateway.get_pool(pool_id).await?;
        projector::project_or_compensate(&self.db, &Projection::Pool(&pool), &conf).await;
        // Members just transitioned to InPool.
        self.reproject_members(&pool, &conf).await;
        info!(pool_id, tx_hash = %conf.tx_hash, "pool created");
        Ok(pool_id)
    }

    /// Contribute to a pool.  Reflects threshold crossings and the ledger's
    /// same-operation auto-distribution at 100%.
    pub async fn invest(
        &self,
        session: &SessionContext,
        pool_id: u64,
        amount: i64,
    ) -> Result<Confirmation> {
        let conf = self
            .gateway
            .submit(session, Operation::Invest { pool_id, amount })
            .await?;

        let pool = self.gateway.get_pool(pool_id).await?;
        projector::project_or_compensate(&self.db, &Projection::Pool(&pool), &conf).await;

        if let Some(investment) = self.gateway.get_investment(pool_id, &session.address).await? {
            projector::project_or_compensate(&self.db, &Projection::Investment(&investment), &conf)
                .await;
        } else {
            warn!(pool_id, investor = %session.address, "confirmed investment not readable yet");
        }

        // Allocation touches member invoices once the threshold is reached.
        if calc::reached_threshold(
            pool.amount_invested,
            pool.total_loan_amount,
            self.config.funding_threshold_pct,
        ) {
            self.reproject_members(&pool, &conf).await;
        }
        Ok(conf)
    }

    /// Withdraw available funds for an invoice.
    pub async fn withdraw(
        &self,
        session: &SessionContext,
        invoice_id: u64,
        amount: i64,
    ) -> Result<Confirmation> {
        // Eligibility guard from fresh ledger truth; the ledger re-checks.
        let invoice = self.gateway.get_invoice(invoice_id).await?;
        let pool_id = invoice
            .pool_id
            .ok_or_else(|| EngineError::Invariant(format!("invoice {invoice_id} is not pooled")))?;
        let pool = self.gateway.get_pool(pool_id).await?;
        let available = calc::withdrawable(
            &invoice,
            pool.amount_invested,
            pool.total_loan_amount,
            self.config.funding_threshold_pct,
        );
        if amount <= 0 || amount > available {
            return Err(EngineError::Invariant(format!(
                "requested {amount} but only {available} is withdrawable"
            )));
        }

        let conf = self
            .gateway
            .submit(session, Operation::WithdrawFunds { invoice_id, amount })
            .await?;
        self.reproject_invoice(invoice_id, &conf).await;
        Ok(conf)
    }

    /// Record that the importer paid.  The payment record itself is written
    /// by the compensation worker — its completion must not gate this call.
    pub async fn mark_invoice_paid(
        &self,
        session: &SessionContext,
        invoice_id: u64,
    ) -> Result<Confirmation> {
        let conf = self
            .gateway
            .submit(session, Operation::MarkInvoicePaid { invoice_id })
            .await?;
        let invoice = self.gateway.get_invoice(invoice_id).await?;
        projector::project_or_compensate(&self.db, &Projection::Invoice(&invoice), &conf).await;

        if let Err(e) = compensation::enqueue(
            &self.db,
            TaskType::PaymentLinkCreate,
            EntityKind::Invoice,
            invoice_id,
            &json!({
                "amount": invoice.shipping_amount,
                "tx_hash": conf.tx_hash,
                "ledger": conf.ledger,
            }),
            Priority::Normal,
        )
        .await
        {
            error!(invoice_id, "could not schedule payment record: {e}");
        }
        Ok(conf)
    }

    /// Distribute pool profits to investors.
    ///
    /// The computed payouts are reconciled against the ledger-reported
    /// `amount_distributed` before anything is projected; a mismatch halts
    /// the flow with an operator alert rather than showing figures that
    /// disagree with on-chain truth.
    pub async fn distribute_profits(
        &self,
        session: &SessionContext,
        pool_id: u64,
    ) -> Result<Vec<Payout>> {
        let conf = self
            .gateway
            .submit(session, Operation::DistributeProfits { pool_id })
            .await?;

        let pool = self.gateway.get_pool(pool_id).await?;
        let investments = self.gateway.get_investors(pool_id).await?;
        let payouts = match calc::reconcile_distribution(
            &investments,
            self.config.yield_rate_bps,
            pool.amount_distributed,
        ) {
            Ok(p) => p,
            Err(e) => {
                error!(
                    pool_id,
                    tx_hash = %conf.tx_hash,
                    "distribution does not reconcile; halting before projection: {e}"
                );
                return Err(e);
            }
        };

        projector::project_or_compensate(&self.db, &Projection::Pool(&pool), &conf).await;
        self.reproject_members(&pool, &conf).await;
        info!(pool_id, distributed = pool.amount_distributed, "profits distributed");
        Ok(payouts)
    }

    pub async fn claim_returns(
        &self,
        session: &SessionContext,
        pool_id: u64,
    ) -> Result<Confirmation> {
        let conf = self
            .gateway
            .submit(session, Operation::ClaimReturns { pool_id })
            .await?;

        let pool = self.gateway.get_pool(pool_id).await?;
        projector::project_or_compensate(&self.db, &Projection::Pool(&pool), &conf).await;
        if let Some(investment) = self.gateway.get_investment(pool_id, &session.address).await? {
            projector::project_or_compensate(&self.db, &Projection::Investment(&investment), &conf)
                .await;
        }
        Ok(conf)
    }

    pub async fn verify_exporter(
        &self,
        session: &SessionContext,
        exporter: &str,
    ) -> Result<Confirmation> {
        self.gateway
            .submit(session, Operation::VerifyExporter { exporter: exporter.to_string() })
            .await
    }

    pub async fn grant_role(
        &self,
        session: &SessionContext,
        address: &str,
        role: Role,
    ) -> Result<Confirmation> {
        self.gateway
            .submit(session, Operation::GrantRole { address: address.to_string(), role })
            .await
    }

    // ─────────────────────────────────────────────────────
    // Derived reads — projections through the calculator
    // ─────────────────────────────────────────────────────

    /// Funding percentage of a pool, from its projection.
    pub async fn funding_percentage(&self, pool_id: u64) -> Result<i64> {
        let record = db::get_pool(&self.db, pool_id)
            .await?
            .ok_or_else(|| EngineError::Decode(format!("pool {pool_id} not projected")))?;
        Ok(calc::funding_percentage(record.amount_invested, record.total_loan_amount))
    }

    /// Amount the exporter could withdraw right now, from projections.
    pub async fn withdrawable(&self, invoice_id: u64) -> Result<i64> {
        let invoice = db::get_invoice(&self.db, invoice_id)
            .await?
            .ok_or_else(|| EngineError::Decode(format!("invoice {invoice_id} not projected")))?;
        let Some(pool_id) = invoice.pool_id else {
            return Ok(0);
        };
        let pool = db::get_pool(&self.db, pool_id as u64)
            .await?
            .ok_or_else(|| EngineError::Decode(format!("pool {pool_id} not projected")))?;
        let capped = if calc::reached_threshold(
            pool.amount_invested,
            pool.total_loan_amount,
            self.config.funding_threshold_pct,
        ) {
            invoice.amount_invested
        } else {
            0
        };
        Ok((capped - invoice.amount_withdrawn).max(0))
    }

    /// USD-cent view of an amount at the configured pinned price.
    pub fn usd_equivalent_cents(&self, amount: i64) -> i64 {
        calc::usd_equivalent_cents(amount, self.config.native_price_usd_cents)
    }

    // ─────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────

    async fn reproject_invoice(&self, invoice_id: u64, conf: &Confirmation) {
        match self.gateway.get_invoice(invoice_id).await {
            Ok(invoice) => {
                projector::project_or_compensate(&self.db, &Projection::Invoice(&invoice), conf)
                    .await;
            }
            Err(e) => {
                warn!(invoice_id, "post-state read failed; compensating: {e}");
                let payload = json!({ "tx_hash": conf.tx_hash, "ledger": conf.ledger });
                if let Err(enqueue_err) = compensation::enqueue(
                    &self.db,
                    TaskType::MetadataSync,
                    EntityKind::Invoice,
                    invoice_id,
                    &payload,
                    Priority::High,
                )
                .await
                {
                    error!(invoice_id, "could not enqueue metadata sync: {enqueue_err}");
                }
            }
        }
    }

    async fn reproject_members(&self, pool: &Pool, conf: &Confirmation) {
        for invoice_id in &pool.invoice_ids {
            self.reproject_invoice(*invoice_id, conf).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryLedger;

    const ADMIN: &str = "GADMIN";
    const EXPORTER: &str = "GEXPORTER";
    const ALICE: &str = "GALICE";
    const BOB: &str = "GBOB";

    fn test_config() -> Config {
        Config {
            rpc_url: String::new(),
            contract_id: "CONTRACT".into(),
            database_url: String::new(),
            api_port: 0,
            yield_rate_bps: 400,
            funding_threshold_pct: 70,
            native_price_usd_cents: 12,
            resolver_max_attempts: 3,
            resolver_delay_ms: 1,
            submit_timeout_secs: 1,
            submit_poll_ms: 1,
            worker_interval_secs: 1,
            max_task_attempts: 5,
            ipfs_unpin_url: None,
            admin_allowlist: vec![ADMIN.into()],
        }
    }

    async fn engine() -> Engine<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::with_admin(ADMIN));
        let db = db::memory_pool().await;
        let engine = Engine::new(ledger, db, test_config());

        let admin = SessionContext::new(ADMIN);
        for (address, role) in [
            (EXPORTER, Role::Exporter),
            (ALICE, Role::Investor),
            (BOB, Role::Investor),
        ] {
            engine.grant_role(&admin, address, role).await.unwrap();
        }
        engine.verify_exporter(&admin, EXPORTER).await.unwrap();
        engine
    }

    fn invoice_params(shipping: i64, loan: i64) -> CreateInvoiceParams {
        CreateInvoiceParams {
            exporter_company: "Acme Exports".into(),
            importer_company: "Widget Imports".into(),
            importer_contact: "ops@widget.example".into(),
            shipping_amount: shipping,
            loan_amount: loan,
            shipping_date: 2_000_000_000,
            document_hash: "bafybeigdyrzt".into(),
        }
    }

    /// Created, approved and pooled invoice; returns (invoice_id, pool_id).
    async fn pooled_invoice(engine: &Engine<InMemoryLedger>, loan: i64) -> (u64, u64) {
        let admin = SessionContext::new(ADMIN);
        let invoice_id = engine
            .create_invoice(
                &SessionContext::new(EXPORTER),
                invoice_params(loan * 5 / 4, loan),
            )
            .await
            .unwrap();
        engine.approve_invoice(&admin, invoice_id).await.unwrap();
        let pool_id = engine
            .create_pool(
                &admin,
                CreatePoolParams {
                    name: "Q3 Electronics".into(),
                    invoice_ids: vec![invoice_id],
                    start_date: 1_700_000_000,
                    end_date: 1_800_000_000,
                },
            )
            .await
            .unwrap();
        (invoice_id, pool_id)
    }

    #[tokio::test]
    async fn create_invoice_projects_confirmed_state() {
        let engine = engine().await;
        let id = engine
            .create_invoice(&SessionContext::new(EXPORTER), invoice_params(12_500, 10_000))
            .await
            .unwrap();

        let stored = db::get_invoice(&engine.db, id).await.unwrap().unwrap();
        assert_eq!(stored.status, "pending");
        assert_eq!(stored.loan_amount, 10_000);
        assert!(!stored.tx_hash.is_empty());
        assert!(stored.ledger > 0);
    }

    #[tokio::test]
    async fn loan_cap_guard_rejects_before_submission() {
        let engine = engine().await;
        let err = engine
            .create_invoice(&SessionContext::new(EXPORTER), invoice_params(10_000, 8_001))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));
    }

    #[tokio::test]
    async fn create_invoice_resolves_despite_indexing_lag() {
        let engine = engine().await;
        engine.gateway.suppress_event_polls(1).await;
        let id = engine
            .create_invoice(&SessionContext::new(EXPORTER), invoice_params(12_500, 10_000))
            .await
            .unwrap();
        assert_eq!(id, 1);
    }

    /// Submits succeed but both the event log and the fallback read are
    /// down, so created ids cannot be recovered.
    struct DeafGateway {
        inner: InMemoryLedger,
    }

    impl LedgerGateway for DeafGateway {
        async fn submit(&self, session: &SessionContext, op: Operation) -> Result<Confirmation> {
            self.inner.submit(session, op).await
        }
        async fn events_in_ledger(&self, ledger: u64) -> Result<Vec<crate::events::LedgerEvent>> {
            let _ = ledger;
            Ok(Vec::new())
        }
        async fn get_invoice(&self, invoice_id: u64) -> Result<crate::types::Invoice> {
            self.inner.get_invoice(invoice_id).await
        }
        async fn get_pool(&self, pool_id: u64) -> Result<Pool> {
            self.inner.get_pool(pool_id).await
        }
        async fn get_investment(
            &self,
            pool_id: u64,
            investor: &str,
        ) -> Result<Option<crate::types::Investment>> {
            self.inner.get_investment(pool_id, investor).await
        }
        async fn get_investors(&self, pool_id: u64) -> Result<Vec<crate::types::Investment>> {
            self.inner.get_investors(pool_id).await
        }
        async fn get_exporter_invoices(&self, exporter: &str) -> Result<Vec<u64>> {
            let _ = exporter;
            Err(EngineError::LedgerUnavailable("rpc offline".into()))
        }
        async fn get_all_open_pools(&self) -> Result<Vec<u64>> {
            self.inner.get_all_open_pools().await
        }
        async fn get_all_pending_invoices(&self) -> Result<Vec<u64>> {
            self.inner.get_all_pending_invoices().await
        }
        async fn get_all_approved_invoices(&self) -> Result<Vec<u64>> {
            self.inner.get_all_approved_invoices().await
        }
        async fn get_pool_funding_percentage(&self, pool_id: u64) -> Result<i64> {
            self.inner.get_pool_funding_percentage(pool_id).await
        }
        async fn can_withdraw(&self, invoice_id: u64) -> Result<bool> {
            self.inner.can_withdraw(invoice_id).await
        }
        async fn get_roles(&self, address: &str) -> Result<Vec<Role>> {
            self.inner.get_roles(address).await
        }
    }

    #[tokio::test]
    async fn unresolved_creation_schedules_document_cleanup() {
        let ledger = InMemoryLedger::with_admin(ADMIN);
        let admin = SessionContext::new(ADMIN);
        ledger.submit(&admin, Operation::GrantRole { address: EXPORTER.into(), role: Role::Exporter })
            .await
            .unwrap();
        ledger
            .submit(&admin, Operation::VerifyExporter { exporter: EXPORTER.into() })
            .await
            .unwrap();

        let db = db::memory_pool().await;
        let engine = Engine::new(Arc::new(DeafGateway { inner: ledger }), db, test_config());

        let err = engine
            .create_invoice(&SessionContext::new(EXPORTER), invoice_params(12_500, 10_000))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IdentifierResolutionFailed { .. }));

        // The uploaded documents are queued for cleanup.
        assert_eq!(db::pending_task_count(&engine.db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn investments_project_and_sum_to_pool_total() {
        let engine = engine().await;
        let (_, pool_id) = pooled_invoice(&engine, 10_000).await;

        engine.invest(&SessionContext::new(ALICE), pool_id, 4_000).await.unwrap();
        engine.invest(&SessionContext::new(BOB), pool_id, 2_000).await.unwrap();
        engine.invest(&SessionContext::new(ALICE), pool_id, 2_000).await.unwrap();

        let pool = db::get_pool(&engine.db, pool_id).await.unwrap().unwrap();
        assert_eq!(pool.amount_invested, 8_000);
        let investments = db::list_pool_investments(&engine.db, pool_id).await.unwrap();
        assert_eq!(investments.len(), 2);
        let sum: i64 = investments.iter().map(|i| i.amount).sum();
        assert_eq!(sum, pool.amount_invested);
    }

    #[tokio::test]
    async fn threshold_unlocks_progressive_withdrawal() {
        let engine = engine().await;
        let (invoice_id, pool_id) = pooled_invoice(&engine, 10_000).await;
        let alice = SessionContext::new(ALICE);

        // 69% — nothing withdrawable.
        engine.invest(&alice, pool_id, 6_900).await.unwrap();
        assert_eq!(engine.withdrawable(invoice_id).await.unwrap(), 0);
        assert_eq!(engine.funding_percentage(pool_id).await.unwrap(), 69);

        // 70% — the invested amount unlocks.
        engine.invest(&alice, pool_id, 100).await.unwrap();
        assert_eq!(engine.withdrawable(invoice_id).await.unwrap(), 7_000);
        assert_eq!(engine.funding_percentage(pool_id).await.unwrap(), 70);

        let stored = db::get_invoice(&engine.db, invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "funded");
    }

    #[tokio::test]
    async fn final_contribution_funds_pool_in_same_operation() {
        let engine = engine().await;
        let (invoice_id, pool_id) = pooled_invoice(&engine, 10_000).await;
        let alice = SessionContext::new(ALICE);

        engine.invest(&alice, pool_id, 9_500).await.unwrap();
        assert_eq!(
            db::get_pool(&engine.db, pool_id).await.unwrap().unwrap().status,
            "partially_funded"
        );

        engine.invest(&alice, pool_id, 500).await.unwrap();
        let pool = db::get_pool(&engine.db, pool_id).await.unwrap().unwrap();
        assert_eq!(pool.status, "funded");
        assert_eq!(pool.amount_invested, 10_000);
        assert_eq!(
            db::get_invoice(&engine.db, invoice_id).await.unwrap().unwrap().amount_invested,
            10_000
        );
    }

    #[tokio::test]
    async fn withdraw_guard_caps_at_withdrawable() {
        let engine = engine().await;
        let (invoice_id, pool_id) = pooled_invoice(&engine, 10_000).await;
        let exporter = SessionContext::new(EXPORTER);

        engine.invest(&SessionContext::new(ALICE), pool_id, 7_000).await.unwrap();

        let err = engine.withdraw(&exporter, invoice_id, 7_001).await.unwrap_err();
        assert!(matches!(err, EngineError::Invariant(_)));

        engine.withdraw(&exporter, invoice_id, 4_000).await.unwrap();
        let stored = db::get_invoice(&engine.db, invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "withdrawn");
        assert_eq!(stored.amount_withdrawn, 4_000);
        assert!(stored.amount_withdrawn <= stored.amount_invested);

        // Second partial withdrawal keeps the status.
        engine.withdraw(&exporter, invoice_id, 3_000).await.unwrap();
        let stored = db::get_invoice(&engine.db, invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "withdrawn");
        assert_eq!(engine.withdrawable(invoice_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_paid_defers_payment_record_to_compensation() {
        let engine = engine().await;
        let (invoice_id, pool_id) = pooled_invoice(&engine, 10_000).await;
        let admin = SessionContext::new(ADMIN);

        engine.invest(&SessionContext::new(ALICE), pool_id, 10_000).await.unwrap();
        engine
            .withdraw(&SessionContext::new(EXPORTER), invoice_id, 10_000)
            .await
            .unwrap();
        engine.mark_invoice_paid(&admin, invoice_id).await.unwrap();

        let stored = db::get_invoice(&engine.db, invoice_id).await.unwrap().unwrap();
        assert_eq!(stored.status, "paid");
        // The payment record is queued, not written inline.
        assert!(db::list_invoice_payments(&engine.db, invoice_id).await.unwrap().is_empty());
        assert_eq!(db::pending_task_count(&engine.db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn full_lifecycle_settles_and_reconciles() {
        let engine = engine().await;
        let (invoice_id, pool_id) = pooled_invoice(&engine, 10_000).await;
        let admin = SessionContext::new(ADMIN);
        let alice = SessionContext::new(ALICE);
        let bob = SessionContext::new(BOB);

        engine.invest(&alice, pool_id, 6_000).await.unwrap();
        engine.invest(&bob, pool_id, 4_000).await.unwrap();
        engine
            .withdraw(&SessionContext::new(EXPORTER), invoice_id, 10_000)
            .await
            .unwrap();
        engine.mark_invoice_paid(&admin, invoice_id).await.unwrap();

        let payouts = engine.distribute_profits(&admin, pool_id).await.unwrap();
        assert_eq!(payouts.len(), 2);
        let total: i64 = payouts.iter().map(|p| p.amount).sum();
        assert_eq!(total, 10_400); // 10_000 × 1.04

        let pool = db::get_pool(&engine.db, pool_id).await.unwrap().unwrap();
        assert_eq!(pool.status, "settling");
        assert_eq!(pool.amount_distributed, 10_400);
        assert_eq!(
            db::get_invoice(&engine.db, invoice_id).await.unwrap().unwrap().status,
            "completed"
        );

        engine.claim_returns(&alice, pool_id).await.unwrap();
        engine.claim_returns(&bob, pool_id).await.unwrap();
        let pool = db::get_pool(&engine.db, pool_id).await.unwrap().unwrap();
        assert_eq!(pool.status, "completed");
    }

    #[tokio::test]
    async fn rejected_invoice_is_terminal_in_projection() {
        let engine = engine().await;
        let admin = SessionContext::new(ADMIN);
        let id = engine
            .create_invoice(&SessionContext::new(EXPORTER), invoice_params(12_500, 10_000))
            .await
            .unwrap();
        engine.reject_invoice(&admin, id).await.unwrap();

        let stored = db::get_invoice(&engine.db, id).await.unwrap().unwrap();
        assert_eq!(stored.status, "rejected");

        // A second approval attempt is rejected by the ledger.
        let err = engine.approve_invoice(&admin, id).await.unwrap_err();
        assert!(matches!(err, EngineError::LedgerRejected { .. }));
    }

    #[tokio::test]
    async fn session_refresh_applies_allowlist() {
        let engine = engine().await;
        let admin = SessionContext::new(ADMIN);
        engine.grant_role(&admin, "GROGUE", Role::Admin).await.unwrap();

        // GROGUE holds Admin on the ledger but is not allow-listed.
        let mut rogue = SessionContext::new("GROGUE");
        rogue
            .refresh(engine.gateway.as_ref(), &engine.config.admin_allowlist)
            .await
            .unwrap();
        assert!(!rogue.is_admin());

        let mut real = SessionContext::new(ADMIN);
        real.refresh(engine.gateway.as_ref(), &engine.config.admin_allowlist)
            .await
            .unwrap();
        assert!(real.is_admin());
    }
}
