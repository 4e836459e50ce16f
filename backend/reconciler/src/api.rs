//! Axum REST API over the projections.
//!
//! Read-only: every row served here is a projection of ledger-confirmed
//! state.  Writes go through the operation flows, never through HTTP.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::calc;
use crate::db::{self, TaskRecord};
use crate::types::{InvestmentRecord, InvoiceRecord, PaymentRecord, PoolRecord};

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct InvoicesResponse {
    pub count: usize,
    pub invoices: Vec<InvoiceRecord>,
}

#[derive(Serialize)]
pub struct InvoiceResponse {
    pub invoice: InvoiceRecord,
    pub payments: Vec<PaymentRecord>,
}

#[derive(Serialize)]
pub struct PoolsResponse {
    pub count: usize,
    pub pools: Vec<PoolSummary>,
}

#[derive(Serialize)]
pub struct PoolSummary {
    #[serde(flatten)]
    pub pool: PoolRecord,
    pub funding_percentage: i64,
}

#[derive(Serialize)]
pub struct InvestmentsResponse {
    pub pool_id: u64,
    pub count: usize,
    pub investments: Vec<InvestmentRecord>,
}

#[derive(Serialize)]
pub struct AbandonedTasksResponse {
    pub count: usize,
    pub tasks: Vec<TaskRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn internal_error(e: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!(ErrorResponse {
            error: e.to_string()
        })),
    )
        .into_response()
}

fn not_found(what: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!(ErrorResponse {
            error: format!("{what} not found")
        })),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /invoices`
pub async fn get_invoices(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match db::list_invoices(&state.pool).await {
        Ok(invoices) => {
            let count = invoices.len();
            (StatusCode::OK, Json(serde_json::json!(InvoicesResponse { count, invoices })))
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// `GET /invoices/:id`
///
/// The invoice projection with any recorded importer payments.
pub async fn get_invoice(
    State(state): State<Arc<ApiState>>,
    Path(invoice_id): Path<u64>,
) -> impl IntoResponse {
    let invoice = match db::get_invoice(&state.pool, invoice_id).await {
        Ok(Some(invoice)) => invoice,
        Ok(None) => return not_found("invoice"),
        Err(e) => return internal_error(e),
    };
    match db::list_invoice_payments(&state.pool, invoice_id).await {
        Ok(payments) => (
            StatusCode::OK,
            Json(serde_json::json!(InvoiceResponse { invoice, payments })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /pools`
///
/// All pools with their derived funding percentage.
pub async fn get_pools(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match db::list_pools(&state.pool).await {
        Ok(pools) => {
            let pools: Vec<PoolSummary> = pools
                .into_iter()
                .map(|pool| PoolSummary {
                    funding_percentage: calc::funding_percentage(
                        pool.amount_invested,
                        pool.total_loan_amount,
                    ),
                    pool,
                })
                .collect();
            let count = pools.len();
            (StatusCode::OK, Json(serde_json::json!(PoolsResponse { count, pools })))
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// `GET /pools/:id`
pub async fn get_pool(
    State(state): State<Arc<ApiState>>,
    Path(pool_id): Path<u64>,
) -> impl IntoResponse {
    match db::get_pool(&state.pool, pool_id).await {
        Ok(Some(pool)) => {
            let summary = PoolSummary {
                funding_percentage: calc::funding_percentage(
                    pool.amount_invested,
                    pool.total_loan_amount,
                ),
                pool,
            };
            (StatusCode::OK, Json(serde_json::json!(summary))).into_response()
        }
        Ok(None) => not_found("pool"),
        Err(e) => internal_error(e),
    }
}

/// `GET /pools/:id/investments`
pub async fn get_pool_investments(
    State(state): State<Arc<ApiState>>,
    Path(pool_id): Path<u64>,
) -> impl IntoResponse {
    match db::list_pool_investments(&state.pool, pool_id).await {
        Ok(investments) => {
            let count = investments.len();
            (
                StatusCode::OK,
                Json(serde_json::json!(InvestmentsResponse {
                    pool_id,
                    count,
                    investments,
                })),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

/// `GET /compensation/abandoned`
///
/// Tasks the worker gave up on.  A non-empty list needs an operator.
pub async fn get_abandoned_tasks(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match db::list_abandoned_tasks(&state.pool).await {
        Ok(tasks) => {
            let count = tasks.len();
            (
                StatusCode::OK,
                Json(serde_json::json!(AbandonedTasksResponse { count, tasks })),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}
