//! JSON-RPC implementation of the ledger gateway.
//!
//! ## Resilience
//!
//! * View calls are safe to retry and get a bounded exponential back-off on
//!   transient failures, up to [`MAX_BACKOFF_SECS`] seconds.
//! * `submit` is never auto-retried: the caller decides what to do with a
//!   `LedgerUnavailable`, because a blind resubmission could double-apply.
//!   After submission, inclusion is polled until the configured timeout.
//!
//! All wire shapes are decoded here, once.  Downstream components only ever
//! see the typed structs from [`crate::types`].

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{EngineError, Result};
use crate::events::{EventKind, LedgerEvent};
use crate::gateway::{LedgerGateway, Operation};
use crate::session::{Role, SessionContext};
use crate::types::{Confirmation, Invoice, InvoiceStatus, Investment, Pool, PoolStatus};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;
const VIEW_RETRY_ATTEMPTS: u32 = 3;

pub struct RpcGateway {
    client: Client,
    rpc_url: String,
    contract_id: String,
    submit_timeout: Duration,
    submit_poll: Duration,
}

impl RpcGateway {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            rpc_url: config.rpc_url.clone(),
            contract_id: config.contract_id.clone(),
            submit_timeout: Duration::from_secs(config.submit_timeout_secs),
            submit_poll: Duration::from_millis(config.submit_poll_ms),
        }
    }

    /// One JSON-RPC round trip, no retries.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| EngineError::LedgerUnavailable(format!("{method}: {e}")))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::LedgerUnavailable(format!(
                "{method}: rate-limited by RPC"
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| EngineError::LedgerUnavailable(format!("{method}: {e}")))?;

        if let Some(err) = body.error {
            // Malformed-request codes are bugs on our side, not outages.
            if err.code == -32600 || err.code == -32601 || err.code == -32602 {
                return Err(EngineError::Decode(format!(
                    "{method}: RPC hard error {}: {}",
                    err.code, err.message
                )));
            }
            return Err(EngineError::LedgerUnavailable(format!(
                "{method}: RPC error {}: {}",
                err.code, err.message
            )));
        }

        body.result
            .ok_or_else(|| EngineError::Decode(format!("{method}: empty result")))
    }

    /// View calls retry transient failures with exponential back-off.
    async fn call_view(&self, method: &str, params: Value) -> Result<Value> {
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempt = 0;
        loop {
            match self.call(method, params.clone()).await {
                Err(e) if e.is_retryable() && attempt + 1 < VIEW_RETRY_ATTEMPTS => {
                    attempt += 1;
                    warn!("{method} failed (retry {attempt} in {backoff}s): {e}");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
                other => return other,
            }
        }
    }

    async fn query_view<T: for<'de> Deserialize<'de>>(
        &self,
        view: &str,
        args: Value,
    ) -> Result<T> {
        let result = self
            .call_view(
                "queryView",
                json!({
                    "contractId": self.contract_id,
                    "view": view,
                    "args": args,
                }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| EngineError::Decode(format!("{view}: {e}")))
    }

    /// Poll `getTransaction` until the ledger reports a final status.
    async fn await_inclusion(&self, op_name: &'static str, tx_hash: String) -> Result<Confirmation> {
        let deadline = Instant::now() + self.submit_timeout;
        loop {
            match self.call("getTransaction", json!({ "txHash": tx_hash })).await {
                Ok(result) => {
                    let tx: TransactionResult = serde_json::from_value(result)
                        .map_err(|e| EngineError::Decode(format!("getTransaction: {e}")))?;
                    match tx.status.as_str() {
                        "SUCCESS" => {
                            let ledger = tx.ledger.ok_or_else(|| {
                                EngineError::Decode("confirmed tx without ledger".to_string())
                            })?;
                            let closed_at = tx
                                .ledger_closed_at
                                .as_deref()
                                .and_then(parse_iso_to_unix)
                                .unwrap_or(0);
                            debug!("{op_name} confirmed in ledger {ledger} ({tx_hash})");
                            return Ok(Confirmation { tx_hash, ledger, closed_at });
                        }
                        "FAILED" => {
                            return Err(EngineError::LedgerRejected {
                                operation: op_name,
                                reason: tx
                                    .reason
                                    .unwrap_or_else(|| "no reason reported".to_string()),
                            });
                        }
                        // PENDING / NOT_FOUND: keep polling.
                        _ => {}
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!("getTransaction for {tx_hash} failed, still polling: {e}");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(EngineError::LedgerUnavailable(format!(
                    "{op_name}: inclusion of {tx_hash} not observed within {:?}",
                    self.submit_timeout
                )));
            }
            tokio::time::sleep(self.submit_poll).await;
        }
    }
}

impl LedgerGateway for RpcGateway {
    async fn submit(&self, caller: &SessionContext, op: Operation) -> Result<Confirmation> {
        let op_name = op.name();
        let result = self
            .call(
                "submitOperation",
                json!({
                    "contractId": self.contract_id,
                    "caller": caller.address,
                    "operation": op,
                }),
            )
            .await?;
        let submitted: SubmitResult = serde_json::from_value(result)
            .map_err(|e| EngineError::Decode(format!("submitOperation: {e}")))?;
        self.await_inclusion(op_name, submitted.tx_hash).await
    }

    async fn events_in_ledger(&self, ledger: u64) -> Result<Vec<LedgerEvent>> {
        let result = self
            .call_view(
                "getEvents",
                json!({
                    "startLedger": ledger,
                    "endLedger": ledger,
                    "filters": [
                        { "type": "contract", "contractIds": [self.contract_id] }
                    ],
                }),
            )
            .await?;
        let events: EventsResult = serde_json::from_value(result)
            .map_err(|e| EngineError::Decode(format!("getEvents: {e}")))?;
        Ok(events
            .events
            .iter()
            .filter_map(decode_event)
            .collect())
    }

    async fn get_invoice(&self, invoice_id: u64) -> Result<Invoice> {
        let view: InvoiceView = self
            .query_view("getInvoice", json!({ "invoiceId": invoice_id }))
            .await?;
        view.try_into()
    }

    async fn get_pool(&self, pool_id: u64) -> Result<Pool> {
        let view: PoolView = self.query_view("getPool", json!({ "poolId": pool_id })).await?;
        view.try_into()
    }

    async fn get_investment(&self, pool_id: u64, investor: &str) -> Result<Option<Investment>> {
        let view: Option<InvestmentView> = self
            .query_view(
                "getInvestment",
                json!({ "poolId": pool_id, "investor": investor }),
            )
            .await?;
        Ok(view.map(Investment::from))
    }

    async fn get_investors(&self, pool_id: u64) -> Result<Vec<Investment>> {
        let views: Vec<InvestmentView> = self
            .query_view("getPoolInvestments", json!({ "poolId": pool_id }))
            .await?;
        Ok(views.into_iter().map(Investment::from).collect())
    }

    async fn get_exporter_invoices(&self, exporter: &str) -> Result<Vec<u64>> {
        self.query_view("getExporterInvoices", json!({ "exporter": exporter }))
            .await
    }

    async fn get_all_open_pools(&self) -> Result<Vec<u64>> {
        self.query_view("getAllOpenPools", json!({})).await
    }

    async fn get_all_pending_invoices(&self) -> Result<Vec<u64>> {
        self.query_view("getAllPendingInvoices", json!({})).await
    }

    async fn get_all_approved_invoices(&self) -> Result<Vec<u64>> {
        self.query_view("getAllApprovedInvoices", json!({})).await
    }

    async fn get_pool_funding_percentage(&self, pool_id: u64) -> Result<i64> {
        self.query_view("getPoolFundingPercentage", json!({ "poolId": pool_id }))
            .await
    }

    async fn can_withdraw(&self, invoice_id: u64) -> Result<bool> {
        self.query_view("canWithdraw", json!({ "invoiceId": invoice_id }))
            .await
    }

    async fn get_roles(&self, address: &str) -> Result<Vec<Role>> {
        let raw: Vec<String> = self
            .query_view("getRoles", json!({ "address": address }))
            .await?;
        Ok(raw
            .iter()
            .filter_map(|s| {
                let role = Role::parse(s);
                if role.is_none() {
                    warn!("ignoring unrecognised role {s:?} for {address}");
                }
                role
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResult {
    #[serde(rename = "txHash")]
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct TransactionResult {
    status: String,
    ledger: Option<u64>,
    #[serde(rename = "ledgerClosedAt")]
    ledger_closed_at: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventsResult {
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize, Clone)]
struct RawEvent {
    /// Decoded topic list; topic 0 is the event symbol, topic 1 the entity id.
    topic: Vec<String>,
    /// Decoded event data object.
    value: Value,
    #[serde(rename = "txHash")]
    tx_hash: Option<String>,
    ledger: Option<u64>,
    #[serde(rename = "ledgerClosedAt")]
    ledger_closed_at: Option<String>,
}

// ─────────────────────────────────────────────────────────
// View result shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceView {
    invoice_id: u64,
    exporter: String,
    exporter_company: String,
    importer_company: String,
    importer_contact: String,
    shipping_amount: i64,
    loan_amount: i64,
    amount_invested: i64,
    amount_withdrawn: i64,
    shipping_date: i64,
    created_at: i64,
    status: String,
    /// Zero while the invoice is not pooled.
    pool_id: u64,
    document_hash: String,
}

impl TryFrom<InvoiceView> for Invoice {
    type Error = EngineError;

    fn try_from(v: InvoiceView) -> Result<Invoice> {
        let status = InvoiceStatus::parse(&v.status)
            .ok_or_else(|| EngineError::Decode(format!("unknown invoice status {:?}", v.status)))?;
        Ok(Invoice {
            invoice_id: v.invoice_id,
            exporter: v.exporter,
            exporter_company: v.exporter_company,
            importer_company: v.importer_company,
            importer_contact: v.importer_contact,
            shipping_amount: v.shipping_amount,
            loan_amount: v.loan_amount,
            amount_invested: v.amount_invested,
            amount_withdrawn: v.amount_withdrawn,
            shipping_date: v.shipping_date,
            created_at: v.created_at,
            status,
            pool_id: (v.pool_id != 0).then_some(v.pool_id),
            document_hash: v.document_hash,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolView {
    pool_id: u64,
    name: String,
    invoice_ids: Vec<u64>,
    total_loan_amount: i64,
    amount_invested: i64,
    amount_distributed: i64,
    fee_paid: i64,
    start_date: i64,
    end_date: i64,
    status: String,
}

impl TryFrom<PoolView> for Pool {
    type Error = EngineError;

    fn try_from(v: PoolView) -> Result<Pool> {
        let status = PoolStatus::parse(&v.status)
            .ok_or_else(|| EngineError::Decode(format!("unknown pool status {:?}", v.status)))?;
        Ok(Pool {
            pool_id: v.pool_id,
            name: v.name,
            invoice_ids: v.invoice_ids,
            total_loan_amount: v.total_loan_amount,
            amount_invested: v.amount_invested,
            amount_distributed: v.amount_distributed,
            fee_paid: v.fee_paid,
            start_date: v.start_date,
            end_date: v.end_date,
            status,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvestmentView {
    pool_id: u64,
    investor: String,
    amount: i64,
    share_bps: i64,
    first_contribution_at: i64,
    last_contribution_at: i64,
    returns_claimed: bool,
}

impl From<InvestmentView> for Investment {
    fn from(v: InvestmentView) -> Investment {
        Investment {
            pool_id: v.pool_id,
            investor: v.investor,
            amount: v.amount,
            share_bps: v.share_bps,
            first_contribution_at: v.first_contribution_at,
            last_contribution_at: v.last_contribution_at,
            returns_claimed: v.returns_claimed,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Event decoding
// ─────────────────────────────────────────────────────────

fn decode_event(raw: &RawEvent) -> Option<LedgerEvent> {
    let first_topic = raw.topic.first()?;
    let kind = EventKind::from_topic(&extract_symbol(first_topic));

    let entity_id = raw.topic.get(1).and_then(|t| extract_u64(t));
    let actor = extract_field(&raw.value, &["actor", "caller", "address"]);
    let amount = raw
        .value
        .get("amount")
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())));
    let timestamp = raw
        .ledger_closed_at
        .as_deref()
        .and_then(parse_iso_to_unix)
        .unwrap_or(0);

    Some(LedgerEvent {
        kind,
        entity_id,
        actor,
        amount,
        ledger: raw.ledger.unwrap_or(0),
        tx_hash: raw.tx_hash.clone().unwrap_or_default(),
        timestamp,
    })
}

fn extract_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(key).and_then(|v| v.as_str()).map(String::from))
}

/// Extract a symbol from a topic entry that may be a decoded JSON object
/// (`{"type":"symbol","value":"invested"}`) or a raw string.
fn extract_symbol(raw: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        if let Some(s) = v.get("value").and_then(|x| x.as_str()) {
            return s.to_string();
        }
    }
    raw.to_string()
}

/// Extract an entity id from a topic entry that may be a JSON object or a
/// bare number/string.
fn extract_u64(raw: &str) -> Option<u64> {
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        if let Some(n) = v.get("value").and_then(|x| x.as_u64()) {
            return Some(n);
        }
        if let Some(s) = v.get("value").and_then(|x| x.as_str()) {
            return s.parse().ok();
        }
        if let Some(n) = v.as_u64() {
            return Some(n);
        }
    }
    raw.parse().ok()
}

/// Parse an ISO-8601 timestamp string into a Unix epoch (seconds).
fn parse_iso_to_unix(s: &str) -> Option<i64> {
    use chrono::DateTime;
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.timestamp())
}
