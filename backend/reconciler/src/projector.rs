//! Cache synchronizer — projects confirmed ledger state into the off-chain
//! store.
//!
//! The store is a read optimization, never a commit point: if a projection
//! write fails, the ledger operation that triggered it is still reported
//! successful, and a compensation task is enqueued so the cache converges
//! later.  Writes are keyed upserts, so a crash-and-retry re-applies cleanly.
//!
//! Before overwriting, the stored status is checked against the freshly
//! confirmed one through the lifecycle state machine; a violation means the
//! read was decoded wrong or the store holds corrupt state, and the write is
//! refused rather than papering over it.

use serde_json::json;
use sqlx::SqlitePool;
use tracing::{error, warn};

use crate::compensation::{Priority, TaskType};
use crate::db;
use crate::errors::{EngineError, Result};
use crate::lifecycle;
use crate::types::{Confirmation, EntityKind, Invoice, InvoiceStatus, Investment, Pool, PoolStatus};

/// How soon a failed write is retried, by failure class.  Store outages
/// clear quickly; validation failures need a newer ledger read, so they
/// wait longer.
const STORE_RETRY_DELAY_SECS: i64 = 5;
const VALIDATION_RETRY_DELAY_SECS: i64 = 300;

/// One confirmed entity state ready to be written.
#[derive(Debug, Clone)]
pub enum Projection<'a> {
    Invoice(&'a Invoice),
    Pool(&'a Pool),
    Investment(&'a Investment),
}

impl Projection<'_> {
    pub fn target_kind(&self) -> EntityKind {
        match self {
            Self::Invoice(_) => EntityKind::Invoice,
            Self::Pool(_) => EntityKind::Pool,
            Self::Investment(_) => EntityKind::Investment,
        }
    }

    pub fn target_id(&self) -> u64 {
        match self {
            Self::Invoice(i) => i.invoice_id,
            Self::Pool(p) => p.pool_id,
            Self::Investment(i) => i.pool_id,
        }
    }
}

/// Validate and upsert one projection.
pub async fn project(db: &SqlitePool, projection: &Projection<'_>, conf: &Confirmation) -> Result<()> {
    match projection {
        Projection::Invoice(invoice) => {
            lifecycle::check_invoice_invariants(invoice)?;
            if let Some(prior) = db::get_invoice(db, invoice.invoice_id).await? {
                let prior_status = InvoiceStatus::parse(&prior.status).ok_or_else(|| {
                    EngineError::Decode(format!("stored invoice status {:?}", prior.status))
                })?;
                lifecycle::validate_invoice_transition(prior_status, invoice.status)?;
            }
            db::upsert_invoice(db, invoice, &conf.tx_hash, conf.ledger).await
        }
        Projection::Pool(pool) => {
            lifecycle::check_pool_invariants(pool)?;
            if let Some(prior) = db::get_pool(db, pool.pool_id).await? {
                let prior_status = PoolStatus::parse(&prior.status).ok_or_else(|| {
                    EngineError::Decode(format!("stored pool status {:?}", prior.status))
                })?;
                lifecycle::validate_pool_transition(prior_status, pool.status)?;
            }
            db::upsert_pool(db, pool, &conf.tx_hash, conf.ledger).await
        }
        Projection::Investment(investment) => {
            if investment.amount < 0 {
                return Err(EngineError::Invariant(format!(
                    "investment by {} in pool {}: negative amount {}",
                    investment.investor, investment.pool_id, investment.amount
                )));
            }
            db::upsert_investment(db, investment, &conf.tx_hash, conf.ledger).await
        }
    }
}

/// Project, and on failure enqueue a metadata-sync compensation task instead
/// of failing the caller.  Returns whether the write landed synchronously.
pub async fn project_or_compensate(
    db: &SqlitePool,
    projection: &Projection<'_>,
    conf: &Confirmation,
) -> bool {
    let err = match project(db, projection, conf).await {
        Ok(()) => return true,
        Err(e) => e,
    };

    let kind = projection.target_kind();
    let id = projection.target_id();
    let wrapped = EngineError::ProjectionWriteFailed {
        target: format!("{} {id}", kind.as_str()),
        detail: err.to_string(),
    };
    warn!("{wrapped}; enqueueing compensation");

    // Store outages retry sooner than validation failures.
    let (delay, priority) = match err {
        EngineError::Database(_) | EngineError::Migrate(_) => {
            (STORE_RETRY_DELAY_SECS, Priority::High)
        }
        _ => (VALIDATION_RETRY_DELAY_SECS, Priority::Normal),
    };

    let mut payload = json!({
        "tx_hash": conf.tx_hash,
        "ledger": conf.ledger,
    });
    if let Projection::Investment(investment) = projection {
        payload["investor"] = json!(investment.investor);
    }

    let next_attempt_at = chrono::Utc::now().timestamp() + delay;
    if let Err(e) = db::enqueue_task(
        db,
        TaskType::MetadataSync.as_str(),
        kind,
        id,
        &payload,
        priority.as_str(),
        next_attempt_at,
    )
    .await
    {
        // Operator alert: both the projection and its compensation failed.
        error!("could not enqueue compensation for {} {id}: {e}", kind.as_str());
    }
    false
}
