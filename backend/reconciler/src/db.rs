//! Database layer — migrations, projection upserts, and the compensation
//! backlog.
//!
//! Projection writes are keyed, field-based upserts: applying the same write
//! twice leaves identical stored state, which is what lets crashed flows be
//! retried blindly.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::errors::Result;
use crate::types::{
    EntityKind, Invoice, InvoiceRecord, Investment, InvestmentRecord, PaymentRecord, Pool,
    PoolRecord,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// A single-connection in-memory pool with migrations applied.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

fn now() -> i64 {
    Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Projection upserts
// ─────────────────────────────────────────────────────────

pub async fn upsert_invoice(
    pool: &SqlitePool,
    invoice: &Invoice,
    tx_hash: &str,
    ledger: u64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO invoices
            (invoice_id, exporter, exporter_company, importer_company, importer_contact,
             shipping_amount, loan_amount, amount_invested, amount_withdrawn,
             shipping_date, created_at, status, pool_id, document_hash,
             tx_hash, ledger, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT (invoice_id) DO UPDATE SET
            amount_invested  = excluded.amount_invested,
            amount_withdrawn = excluded.amount_withdrawn,
            status           = excluded.status,
            pool_id          = excluded.pool_id,
            tx_hash          = excluded.tx_hash,
            ledger           = excluded.ledger,
            updated_at       = excluded.updated_at
        "#,
    )
    .bind(invoice.invoice_id as i64)
    .bind(&invoice.exporter)
    .bind(&invoice.exporter_company)
    .bind(&invoice.importer_company)
    .bind(&invoice.importer_contact)
    .bind(invoice.shipping_amount)
    .bind(invoice.loan_amount)
    .bind(invoice.amount_invested)
    .bind(invoice.amount_withdrawn)
    .bind(invoice.shipping_date)
    .bind(invoice.created_at)
    .bind(invoice.status.as_str())
    .bind(invoice.pool_id.map(|p| p as i64))
    .bind(&invoice.document_hash)
    .bind(tx_hash)
    .bind(ledger as i64)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_pool(
    pool: &SqlitePool,
    record: &Pool,
    tx_hash: &str,
    ledger: u64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO pools
            (pool_id, name, invoice_ids, total_loan_amount, amount_invested,
             amount_distributed, fee_paid, start_date, end_date, status,
             tx_hash, ledger, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT (pool_id) DO UPDATE SET
            amount_invested    = excluded.amount_invested,
            amount_distributed = excluded.amount_distributed,
            fee_paid           = excluded.fee_paid,
            status             = excluded.status,
            tx_hash            = excluded.tx_hash,
            ledger             = excluded.ledger,
            updated_at         = excluded.updated_at
        "#,
    )
    .bind(record.pool_id as i64)
    .bind(&record.name)
    .bind(serde_json::to_string(&record.invoice_ids)?)
    .bind(record.total_loan_amount)
    .bind(record.amount_invested)
    .bind(record.amount_distributed)
    .bind(record.fee_paid)
    .bind(record.start_date)
    .bind(record.end_date)
    .bind(record.status.as_str())
    .bind(tx_hash)
    .bind(ledger as i64)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_investment(
    pool: &SqlitePool,
    investment: &Investment,
    tx_hash: &str,
    ledger: u64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO investments
            (pool_id, investor, amount, share_bps, first_contribution_at,
             last_contribution_at, returns_claimed, tx_hash, ledger, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT (pool_id, investor) DO UPDATE SET
            amount               = excluded.amount,
            share_bps            = excluded.share_bps,
            last_contribution_at = excluded.last_contribution_at,
            returns_claimed      = excluded.returns_claimed,
            tx_hash              = excluded.tx_hash,
            ledger               = excluded.ledger,
            updated_at           = excluded.updated_at
        "#,
    )
    .bind(investment.pool_id as i64)
    .bind(&investment.investor)
    .bind(investment.amount)
    .bind(investment.share_bps)
    .bind(investment.first_contribution_at)
    .bind(investment.last_contribution_at)
    .bind(investment.returns_claimed as i64)
    .bind(tx_hash)
    .bind(ledger as i64)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record an importer payment.  Keyed by `(invoice_id, tx_hash)` so a
/// compensated retry cannot produce a second row.
pub async fn insert_payment(
    pool: &SqlitePool,
    invoice_id: u64,
    amount: i64,
    tx_hash: &str,
    ledger: u64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO payments (invoice_id, amount, tx_hash, ledger, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(invoice_id as i64)
    .bind(amount)
    .bind(tx_hash)
    .bind(ledger as i64)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Projection reads
// ─────────────────────────────────────────────────────────

pub async fn get_invoice(pool: &SqlitePool, invoice_id: u64) -> Result<Option<InvoiceRecord>> {
    let row = sqlx::query_as::<_, InvoiceRecord>(
        "SELECT * FROM invoices WHERE invoice_id = ?1",
    )
    .bind(invoice_id as i64)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_invoices(pool: &SqlitePool) -> Result<Vec<InvoiceRecord>> {
    let rows = sqlx::query_as::<_, InvoiceRecord>(
        "SELECT * FROM invoices ORDER BY invoice_id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_pool(pool: &SqlitePool, pool_id: u64) -> Result<Option<PoolRecord>> {
    let row = sqlx::query_as::<_, PoolRecord>("SELECT * FROM pools WHERE pool_id = ?1")
        .bind(pool_id as i64)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn list_pools(pool: &SqlitePool) -> Result<Vec<PoolRecord>> {
    let rows = sqlx::query_as::<_, PoolRecord>("SELECT * FROM pools ORDER BY pool_id ASC")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn list_pool_investments(
    pool: &SqlitePool,
    pool_id: u64,
) -> Result<Vec<InvestmentRecord>> {
    let rows = sqlx::query_as::<_, InvestmentRecord>(
        r#"
        SELECT * FROM investments
        WHERE  pool_id = ?1
        ORDER  BY first_contribution_at ASC, investor ASC
        "#,
    )
    .bind(pool_id as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn list_invoice_payments(
    pool: &SqlitePool,
    invoice_id: u64,
) -> Result<Vec<PaymentRecord>> {
    let rows = sqlx::query_as::<_, PaymentRecord>(
        "SELECT * FROM payments WHERE invoice_id = ?1 ORDER BY id ASC",
    )
    .bind(invoice_id as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Compensation backlog
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRecord {
    pub id: i64,
    pub task_type: String,
    pub target_kind: String,
    pub target_id: i64,
    pub payload: String,
    pub priority: String,
    pub attempt_count: i64,
    pub status: String,
    pub last_error: Option<String>,
    pub next_attempt_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append a task to the backlog.  Returns its id.
pub async fn enqueue_task(
    pool: &SqlitePool,
    task_type: &str,
    target_kind: EntityKind,
    target_id: u64,
    payload: &serde_json::Value,
    priority: &str,
    next_attempt_at: i64,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO compensation_tasks
            (task_type, target_kind, target_id, payload, priority,
             next_attempt_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        "#,
    )
    .bind(task_type)
    .bind(target_kind.as_str())
    .bind(target_id as i64)
    .bind(payload.to_string())
    .bind(priority)
    .bind(next_attempt_at)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Pending tasks that are due, ordered by priority then age — except that a
/// task is held back while an older pending task exists for the same target,
/// so a later correction can never be overwritten by a stale earlier retry.
pub async fn due_tasks(pool: &SqlitePool, as_of: i64, limit: i64) -> Result<Vec<TaskRecord>> {
    let rows = sqlx::query_as::<_, TaskRecord>(
        r#"
        SELECT * FROM compensation_tasks t
        WHERE  t.status = 'pending'
          AND  t.next_attempt_at <= ?1
          AND  NOT EXISTS (
                 SELECT 1 FROM compensation_tasks e
                 WHERE  e.status = 'pending'
                   AND  e.target_kind = t.target_kind
                   AND  e.target_id = t.target_id
                   AND  e.id < t.id
               )
        ORDER  BY CASE t.priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END,
               t.id ASC
        LIMIT  ?2
        "#,
    )
    .bind(as_of)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn mark_task_succeeded(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE compensation_tasks SET status = 'succeeded', updated_at = ?2 WHERE id = ?1",
    )
    .bind(id)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a failed attempt and schedule the next one.
pub async fn mark_task_failed(
    pool: &SqlitePool,
    id: i64,
    error: &str,
    next_attempt_at: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE compensation_tasks
        SET    attempt_count = attempt_count + 1,
               last_error = ?2,
               next_attempt_at = ?3,
               updated_at = ?4
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(next_attempt_at)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_task_abandoned(pool: &SqlitePool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE compensation_tasks
        SET    status = 'abandoned',
               attempt_count = attempt_count + 1,
               last_error = ?2,
               updated_at = ?3
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(now())
    .execute(pool)
    .await?;
    Ok(())
}

/// Abandoned tasks, newest first — the operator's worklist.
pub async fn list_abandoned_tasks(pool: &SqlitePool) -> Result<Vec<TaskRecord>> {
    let rows = sqlx::query_as::<_, TaskRecord>(
        "SELECT * FROM compensation_tasks WHERE status = 'abandoned' ORDER BY updated_at DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn pending_task_count(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM compensation_tasks WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}
