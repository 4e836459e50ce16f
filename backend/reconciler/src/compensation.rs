//! Compensation queue — durable backlog of off-chain work that must
//! eventually happen.
//!
//! Tasks are enqueued when a projection write fails, or when a side effect
//! (payment record, document cleanup) should not gate the caller's success.
//! A single logical worker drains the backlog; [`crate::db::due_tasks`]
//! orders candidates by priority and holds a task back while an older
//! pending task exists for the same target, so retries for one entity are
//! strictly FIFO.  After a bounded number of attempts a task is abandoned
//! and surfaced to operators via the read API.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::{self, TaskRecord};
use crate::errors::{EngineError, Result};
use crate::gateway::LedgerGateway;
use crate::projector::{self, Projection};
use crate::types::{Confirmation, EntityKind};

const BATCH_LIMIT: i64 = 50;
const BASE_BACKOFF_SECS: i64 = 5;
const MAX_BACKOFF_SECS: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    /// Re-read an entity from the ledger and re-project it.
    MetadataSync,
    /// Write the payment record for a settled invoice.
    PaymentLinkCreate,
    /// Unpin uploaded documents after a creation that ultimately failed.
    IpfsCleanup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetadataSync => "metadata-sync",
            Self::PaymentLinkCreate => "payment-link-create",
            Self::IpfsCleanup => "ipfs-cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metadata-sync" => Some(Self::MetadataSync),
            "payment-link-create" => Some(Self::PaymentLinkCreate),
            "ipfs-cleanup" => Some(Self::IpfsCleanup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Enqueue a task due immediately.
pub async fn enqueue(
    db: &SqlitePool,
    task_type: TaskType,
    target_kind: EntityKind,
    target_id: u64,
    payload: &Value,
    priority: Priority,
) -> Result<i64> {
    db::enqueue_task(
        db,
        task_type.as_str(),
        target_kind,
        target_id,
        payload,
        priority.as_str(),
        0,
    )
    .await
}

/// The single logical worker draining the compensation backlog.
pub struct CompensationWorker<G> {
    db: SqlitePool,
    gateway: Arc<G>,
    http: reqwest::Client,
    interval: Duration,
    max_attempts: i64,
    ipfs_unpin_url: Option<String>,
}

impl<G: LedgerGateway + Send + Sync> CompensationWorker<G> {
    pub fn new(db: SqlitePool, gateway: Arc<G>, http: reqwest::Client, config: &Config) -> Self {
        Self {
            db,
            gateway,
            http,
            interval: Duration::from_secs(config.worker_interval_secs),
            max_attempts: config.max_task_attempts,
            ipfs_unpin_url: config.ipfs_unpin_url.clone(),
        }
    }

    /// Run until cancelled.  Spawn as a background [`tokio`] task.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Compensation worker starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Compensation worker stopping");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.process_due().await {
                error!("Compensation sweep failed: {e}");
            }
        }
    }

    /// One sweep over the due backlog.  Returns how many tasks succeeded.
    pub async fn process_due(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let tasks = db::due_tasks(&self.db, now, BATCH_LIMIT).await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let mut succeeded = 0usize;
        for task in tasks {
            match self.handle(&task).await {
                Ok(()) => {
                    db::mark_task_succeeded(&self.db, task.id).await?;
                    info!(
                        task_id = task.id,
                        task_type = %task.task_type,
                        attempts = task.attempt_count + 1,
                        "compensation task succeeded"
                    );
                    succeeded += 1;
                }
                Err(e) => {
                    let attempts = task.attempt_count + 1;
                    if attempts >= self.max_attempts {
                        db::mark_task_abandoned(&self.db, task.id, &e.to_string()).await?;
                        // Operator alert: manual intervention needed.
                        error!(
                            task_id = task.id,
                            task_type = %task.task_type,
                            target = %format!("{} {}", task.target_kind, task.target_id),
                            attempts,
                            "abandoning compensation task: {e}"
                        );
                    } else {
                        let backoff = (BASE_BACKOFF_SECS << attempts.min(9)).min(MAX_BACKOFF_SECS);
                        db::mark_task_failed(&self.db, task.id, &e.to_string(), now + backoff)
                            .await?;
                        warn!(
                            task_id = task.id,
                            task_type = %task.task_type,
                            attempts,
                            retry_in_secs = backoff,
                            "compensation task failed: {e}"
                        );
                    }
                }
            }
        }
        Ok(succeeded)
    }

    async fn handle(&self, task: &TaskRecord) -> Result<()> {
        let payload: Value = serde_json::from_str(&task.payload)?;
        let task_type = TaskType::parse(&task.task_type)
            .ok_or_else(|| EngineError::Decode(format!("unknown task type {:?}", task.task_type)))?;
        match task_type {
            TaskType::MetadataSync => self.sync_metadata(task, &payload).await,
            TaskType::PaymentLinkCreate => self.create_payment(task, &payload).await,
            TaskType::IpfsCleanup => self.unpin_documents(&payload).await,
        }
    }

    /// Re-read the target from the ledger and project the current truth —
    /// never the possibly-stale state captured when the task was enqueued.
    async fn sync_metadata(&self, task: &TaskRecord, payload: &Value) -> Result<()> {
        let conf = confirmation_from_payload(payload);
        let kind = EntityKind::parse(&task.target_kind).ok_or_else(|| {
            EngineError::Decode(format!("unknown target kind {:?}", task.target_kind))
        })?;
        match kind {
            EntityKind::Invoice => {
                let invoice = self.gateway.get_invoice(task.target_id as u64).await?;
                projector::project(&self.db, &Projection::Invoice(&invoice), &conf).await
            }
            EntityKind::Pool => {
                let pool = self.gateway.get_pool(task.target_id as u64).await?;
                projector::project(&self.db, &Projection::Pool(&pool), &conf).await
            }
            EntityKind::Investment => {
                let investor = payload
                    .get("investor")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        EngineError::Decode("investment sync without investor".to_string())
                    })?;
                let investment = self
                    .gateway
                    .get_investment(task.target_id as u64, investor)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Decode(format!(
                            "no investment by {investor} in pool {}",
                            task.target_id
                        ))
                    })?;
                projector::project(&self.db, &Projection::Investment(&investment), &conf).await
            }
            EntityKind::Payment => Err(EngineError::Decode(
                "payments are not metadata-synced".to_string(),
            )),
        }
    }

    async fn create_payment(&self, task: &TaskRecord, payload: &Value) -> Result<()> {
        let amount = payload
            .get("amount")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| EngineError::Decode("payment task without amount".to_string()))?;
        let conf = confirmation_from_payload(payload);
        db::insert_payment(&self.db, task.target_id as u64, amount, &conf.tx_hash, conf.ledger)
            .await
    }

    async fn unpin_documents(&self, payload: &Value) -> Result<()> {
        let hash = payload
            .get("document_hash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Decode("cleanup task without document_hash".to_string()))?;

        let Some(url) = &self.ipfs_unpin_url else {
            warn!("no unpin endpoint configured; dropping cleanup for {hash}");
            return Ok(());
        };
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "hash": hash }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(EngineError::LedgerUnavailable(format!(
                "unpin of {hash} returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn confirmation_from_payload(payload: &Value) -> Confirmation {
    Confirmation {
        tx_hash: payload
            .get("tx_hash")
            .and_then(|v| v.as_str())
            .unwrap_or("compensated")
            .to_string(),
        ledger: payload.get("ledger").and_then(|v| v.as_u64()).unwrap_or(0),
        closed_at: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::gateway::{InMemoryLedger, Operation};
    use crate::session::{Role, SessionContext};

    const ADMIN: &str = "GADMIN";
    const EXPORTER: &str = "GEXPORTER";

    async fn ledger_with_invoice() -> InMemoryLedger {
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
            .unwrap();
        ledger
    }

    fn worker_config(max_attempts: i64) -> Config {
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
            max_task_attempts: max_attempts,
            ipfs_unpin_url: None,
            admin_allowlist: vec![ADMIN.into()],
        }
    }

    async fn worker(max_attempts: i64) -> (CompensationWorker<InMemoryLedger>, SqlitePool) {
        let db = crate::db::memory_pool().await;
        let ledger = Arc::new(ledger_with_invoice().await);
        let worker = CompensationWorker::new(
            db.clone(),
            ledger,
            reqwest::Client::new(),
            &worker_config(max_attempts),
        );
        (worker, db)
    }

    #[tokio::test]
    async fn metadata_sync_reprojects_from_ledger() {
        let (worker, db) = worker(5).await;
        enqueue(
            &db,
            TaskType::MetadataSync,
            EntityKind::Invoice,
            1,
            &json!({"tx_hash": "0xabc", "ledger": 103}),
            Priority::High,
        )
        .await
        .unwrap();

        assert_eq!(worker.process_due().await.unwrap(), 1);
        let stored = crate::db::get_invoice(&db, 1).await.unwrap().unwrap();
        assert_eq!(stored.status, "pending");
        assert_eq!(stored.tx_hash, "0xabc");
        assert_eq!(crate::db::pending_task_count(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn payment_task_writes_payment_record() {
        let (worker, db) = worker(5).await;
        enqueue(
            &db,
            TaskType::PaymentLinkCreate,
            EntityKind::Invoice,
            1,
            &json!({"amount": 7_000, "tx_hash": "0xdef", "ledger": 110}),
            Priority::Normal,
        )
        .await
        .unwrap();

        assert_eq!(worker.process_due().await.unwrap(), 1);
        let payments = crate::db::list_invoice_payments(&db, 1).await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, 7_000);
    }

    #[tokio::test]
    async fn cleanup_without_endpoint_is_dropped_not_retried() {
        let (worker, db) = worker(5).await;
        enqueue(
            &db,
            TaskType::IpfsCleanup,
            EntityKind::Invoice,
            0,
            &json!({"document_hash": "bafybeigdyrzt"}),
            Priority::Low,
        )
        .await
        .unwrap();
        assert_eq!(worker.process_due().await.unwrap(), 1);
        assert_eq!(crate::db::pending_task_count(&db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_task_is_abandoned_after_attempt_budget() {
        let (worker, db) = worker(1).await;
        enqueue(
            &db,
            TaskType::PaymentLinkCreate,
            EntityKind::Invoice,
            1,
            &json!({}), // missing amount
            Priority::Normal,
        )
        .await
        .unwrap();

        assert_eq!(worker.process_due().await.unwrap(), 0);
        let abandoned = crate::db::list_abandoned_tasks(&db).await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn failed_task_is_rescheduled_with_backoff() {
        let (worker, db) = worker(5).await;
        enqueue(
            &db,
            TaskType::MetadataSync,
            EntityKind::Invoice,
            999, // unknown on the ledger
            &json!({"tx_hash": "0x0", "ledger": 1}),
            Priority::Normal,
        )
        .await
        .unwrap();

        assert_eq!(worker.process_due().await.unwrap(), 0);
        // Rescheduled into the future, so not due right now.
        assert!(db::due_tasks(&db, Utc::now().timestamp(), 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(crate::db::pending_task_count(&db).await.unwrap(), 1);
    }
}
