//! Ledger gateway — the only component that talks to the authoritative ledger.
//!
//! [`LedgerGateway`] has two implementations, selected once at construction:
//!
//! * [`crate::rpc::RpcGateway`] — the real JSON-RPC network client.
//! * [`InMemoryLedger`] — a deterministic fake with the contract's full
//!   semantics, used by tests and local development.
//!
//! `submit` blocks until the ledger reports inclusion; it never returns
//! optimistically.  Authorization is checked by the ledger itself — the
//! gateway only surfaces its rejection reason verbatim.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::calc;
use crate::errors::{EngineError, Result};
use crate::events::{EventKind, LedgerEvent};
use crate::session::{Role, SessionContext};
use crate::types::{Confirmation, Invoice, InvoiceStatus, Investment, Pool, PoolStatus};

/// The fixed allow-list of state-changing operations, each with its
/// strongly-typed parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    CreateInvoice {
        exporter_company: String,
        importer_company: String,
        importer_contact: String,
        shipping_amount: i64,
        loan_amount: i64,
        shipping_date: i64,
        document_hash: String,
    },
    ApproveInvoice {
        invoice_id: u64,
    },
    RejectInvoice {
        invoice_id: u64,
    },
    CreatePool {
        name: String,
        invoice_ids: Vec<u64>,
        start_date: i64,
        end_date: i64,
    },
    Invest {
        pool_id: u64,
        amount: i64,
    },
    WithdrawFunds {
        invoice_id: u64,
        amount: i64,
    },
    MarkInvoicePaid {
        invoice_id: u64,
    },
    DistributeProfits {
        pool_id: u64,
    },
    ClaimReturns {
        pool_id: u64,
    },
    VerifyExporter {
        exporter: String,
    },
    GrantRole {
        address: String,
        role: Role,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateInvoice { .. } => "create_invoice",
            Self::ApproveInvoice { .. } => "approve_invoice",
            Self::RejectInvoice { .. } => "reject_invoice",
            Self::CreatePool { .. } => "create_pool",
            Self::Invest { .. } => "invest",
            Self::WithdrawFunds { .. } => "withdraw_funds",
            Self::MarkInvoicePaid { .. } => "mark_invoice_paid",
            Self::DistributeProfits { .. } => "distribute_profits",
            Self::ClaimReturns { .. } => "claim_returns",
            Self::VerifyExporter { .. } => "verify_exporter",
            Self::GrantRole { .. } => "grant_role",
        }
    }
}

/// Access to the authoritative ledger: one blocking submit plus the
/// contract's view calls.  Each view decodes into a typed struct here, once;
/// downstream components never see raw tuples.
pub trait LedgerGateway {
    /// Submit a state-changing operation and wait for inclusion.
    ///
    /// Exactly one ledger state change on success, none on failure.
    fn submit(
        &self,
        caller: &SessionContext,
        op: Operation,
    ) -> impl std::future::Future<Output = Result<Confirmation>> + Send;

    /// Events recorded in the given ledger sequence, oldest first.
    ///
    /// May lag inclusion; the event resolver absorbs that.
    fn events_in_ledger(
        &self,
        ledger: u64,
    ) -> impl std::future::Future<Output = Result<Vec<LedgerEvent>>> + Send;

    fn get_invoice(&self, invoice_id: u64)
        -> impl std::future::Future<Output = Result<Invoice>> + Send;

    fn get_pool(&self, pool_id: u64) -> impl std::future::Future<Output = Result<Pool>> + Send;

    fn get_investment(
        &self,
        pool_id: u64,
        investor: &str,
    ) -> impl std::future::Future<Output = Result<Option<Investment>>> + Send;

    /// All investments in a pool, ordered by first contribution.
    fn get_investors(
        &self,
        pool_id: u64,
    ) -> impl std::future::Future<Output = Result<Vec<Investment>>> + Send;

    /// Invoice ids belonging to an exporter, in creation order.
    fn get_exporter_invoices(
        &self,
        exporter: &str,
    ) -> impl std::future::Future<Output = Result<Vec<u64>>> + Send;

    fn get_all_open_pools(&self) -> impl std::future::Future<Output = Result<Vec<u64>>> + Send;

    fn get_all_pending_invoices(&self)
        -> impl std::future::Future<Output = Result<Vec<u64>>> + Send;

    fn get_all_approved_invoices(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<u64>>> + Send;

    fn get_pool_funding_percentage(
        &self,
        pool_id: u64,
    ) -> impl std::future::Future<Output = Result<i64>> + Send;

    fn can_withdraw(&self, invoice_id: u64)
        -> impl std::future::Future<Output = Result<bool>> + Send;

    fn get_roles(&self, address: &str)
        -> impl std::future::Future<Output = Result<Vec<Role>>> + Send;
}

// ─────────────────────────────────────────────────────────
// Deterministic in-memory ledger
// ─────────────────────────────────────────────────────────

/// In-memory [`LedgerGateway`] implementing the financing contract's
/// semantics exactly: role gating, the loan cap, per-contribution
/// proportional allocation, threshold transitions and same-operation
/// auto-distribution at 100%.
///
/// Determinism knobs for tests: [`InMemoryLedger::set_unavailable`] makes
/// every call fail transiently, and [`InMemoryLedger::suppress_event_polls`]
/// hides the event log for a fixed number of reads to simulate indexing lag.
pub struct InMemoryLedger {
    inner: Mutex<LedgerInner>,
    yield_rate_bps: i64,
    funding_threshold_pct: i64,
    fee_bps: i64,
}

struct LedgerInner {
    next_invoice_id: u64,
    next_pool_id: u64,
    ledger_seq: u64,
    now: i64,
    invoices: HashMap<u64, Invoice>,
    invoice_order: Vec<u64>,
    pools: HashMap<u64, Pool>,
    investments: HashMap<(u64, String), Investment>,
    events: Vec<LedgerEvent>,
    roles: HashMap<String, HashSet<Role>>,
    verified_exporters: HashSet<String>,
    unavailable: bool,
    suppressed_event_polls: u32,
}

impl InMemoryLedger {
    /// A ledger seeded with one admin identity, at the deployment's 4% rate
    /// and 70% threshold.
    pub fn with_admin(admin: &str) -> Self {
        let mut roles = HashMap::new();
        roles.insert(
            admin.to_string(),
            [Role::Admin].into_iter().collect::<HashSet<_>>(),
        );
        Self {
            inner: Mutex::new(LedgerInner {
                next_invoice_id: 1,
                next_pool_id: 1,
                ledger_seq: 100,
                now: 1_700_000_000,
                invoices: HashMap::new(),
                invoice_order: Vec::new(),
                pools: HashMap::new(),
                investments: HashMap::new(),
                events: Vec::new(),
                roles,
                verified_exporters: HashSet::new(),
                unavailable: false,
                suppressed_event_polls: 0,
            }),
            yield_rate_bps: 400,
            funding_threshold_pct: 70,
            fee_bps: 100,
        }
    }

    /// Make every subsequent call fail with `LedgerUnavailable`.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().await.unavailable = unavailable;
    }

    /// Hide the event log for the next `polls` reads of `events_in_ledger`.
    pub async fn suppress_event_polls(&self, polls: u32) {
        self.inner.lock().await.suppressed_event_polls = polls;
    }
}

fn rejected(op: &'static str, reason: impl Into<String>) -> EngineError {
    EngineError::LedgerRejected {
        operation: op,
        reason: reason.into(),
    }
}

impl LedgerInner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            Err(EngineError::LedgerUnavailable(
                "in-memory ledger marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn has_role(&self, address: &str, role: Role) -> bool {
        self.roles.get(address).is_some_and(|r| r.contains(&role))
    }

    fn require_role(&self, op: &'static str, address: &str, role: Role) -> Result<()> {
        if self.has_role(address, role) {
            Ok(())
        } else {
            Err(rejected(op, format!("{address} lacks role {}", role.as_str())))
        }
    }

    fn next_confirmation(&mut self) -> Confirmation {
        self.ledger_seq += 1;
        self.now += 5;
        Confirmation {
            tx_hash: format!("0x{}", hex::encode(self.ledger_seq.to_be_bytes())),
            ledger: self.ledger_seq,
            closed_at: self.now,
        }
    }

    fn emit(&mut self, conf: &Confirmation, kind: EventKind, entity_id: Option<u64>, actor: Option<String>, amount: Option<i64>) {
        self.events.push(LedgerEvent {
            kind,
            entity_id,
            actor,
            amount,
            ledger: conf.ledger,
            tx_hash: conf.tx_hash.clone(),
            timestamp: conf.closed_at,
        });
    }

    /// Re-derive pool status and per-invoice allocation after a contribution.
    ///
    /// Allocation is proportional to each invoice's loan share on every
    /// contribution, so exporters accrue withdrawable funds progressively;
    /// at 100% each invoice holds exactly its loan amount and the pool
    /// becomes Funded within the same operation.
    fn apply_allocation(&mut self, pool_id: u64, threshold_pct: i64) {
        let Some(pool) = self.pools.get_mut(&pool_id) else {
            return;
        };
        let invested = pool.amount_invested;
        let total = pool.total_loan_amount;
        let fully_funded = invested == total;
        let at_threshold = calc::reached_threshold(invested, total, threshold_pct);

        pool.status = if fully_funded {
            PoolStatus::Funded
        } else if at_threshold {
            PoolStatus::PartiallyFunded
        } else {
            PoolStatus::Fundraising
        };

        let member_ids = pool.invoice_ids.clone();
        for id in member_ids {
            if let Some(inv) = self.invoices.get_mut(&id) {
                inv.amount_invested =
                    (inv.loan_amount as i128 * invested as i128 / total as i128) as i64;
                if at_threshold && inv.status == InvoiceStatus::InPool {
                    inv.status = InvoiceStatus::Funded;
                }
            }
        }
    }

    fn recompute_shares(&mut self, pool_id: u64) {
        let invested = match self.pools.get(&pool_id) {
            Some(p) => p.amount_invested,
            None => return,
        };
        for ((pid, _), investment) in self.investments.iter_mut() {
            if *pid == pool_id {
                investment.share_bps = calc::share_bps(investment.amount, invested);
            }
        }
    }
}

impl LedgerGateway for InMemoryLedger {
    async fn submit(&self, caller: &SessionContext, op: Operation) -> Result<Confirmation> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        let name = op.name();
        let caller_addr = caller.address.clone();

        match op {
            Operation::CreateInvoice {
                exporter_company,
                importer_company,
                importer_contact,
                shipping_amount,
                loan_amount,
                shipping_date,
                document_hash,
            } => {
                inner.require_role(name, &caller_addr, Role::Exporter)?;
                if !inner.verified_exporters.contains(&caller_addr) {
                    return Err(rejected(name, format!("exporter {caller_addr} not verified")));
                }
                if shipping_amount <= 0 || loan_amount <= 0 {
                    return Err(rejected(name, "amounts must be positive"));
                }
                if loan_amount as i128 * 5 > shipping_amount as i128 * 4 {
                    return Err(rejected(
                        name,
                        format!("loan_amount {loan_amount} exceeds 80% of shipping_amount {shipping_amount}"),
                    ));
                }
                if shipping_date <= inner.now {
                    return Err(rejected(name, "shipping_date must be in the future"));
                }

                let conf = inner.next_confirmation();
                let id = inner.next_invoice_id;
                inner.next_invoice_id += 1;
                let created_at = inner.now;
                inner.invoices.insert(
                    id,
                    Invoice {
                        invoice_id: id,
                        exporter: caller_addr.clone(),
                        exporter_company,
                        importer_company,
                        importer_contact,
                        shipping_amount,
                        loan_amount,
                        amount_invested: 0,
                        amount_withdrawn: 0,
                        shipping_date,
                        created_at,
                        status: InvoiceStatus::Pending,
                        pool_id: None,
                        document_hash,
                    },
                );
                inner.invoice_order.push(id);
                inner.emit(&conf, EventKind::InvoiceCreated, Some(id), Some(caller_addr), Some(loan_amount));
                Ok(conf)
            }

            Operation::ApproveInvoice { invoice_id } => {
                inner.require_role(name, &caller_addr, Role::Admin)?;
                let status = inner
                    .invoices
                    .get(&invoice_id)
                    .map(|i| i.status)
                    .ok_or_else(|| rejected(name, format!("unknown invoice {invoice_id}")))?;
                if status != InvoiceStatus::Pending {
                    return Err(rejected(name, format!("invoice {invoice_id} is not pending")));
                }
                let conf = inner.next_confirmation();
                if let Some(inv) = inner.invoices.get_mut(&invoice_id) {
                    inv.status = InvoiceStatus::Approved;
                }
                inner.emit(&conf, EventKind::InvoiceApproved, Some(invoice_id), Some(caller_addr), None);
                Ok(conf)
            }

            Operation::RejectInvoice { invoice_id } => {
                inner.require_role(name, &caller_addr, Role::Admin)?;
                let status = inner
                    .invoices
                    .get(&invoice_id)
                    .map(|i| i.status)
                    .ok_or_else(|| rejected(name, format!("unknown invoice {invoice_id}")))?;
                if status != InvoiceStatus::Pending {
                    return Err(rejected(name, format!("invoice {invoice_id} is not pending")));
                }
                let conf = inner.next_confirmation();
                if let Some(inv) = inner.invoices.get_mut(&invoice_id) {
                    inv.status = InvoiceStatus::Rejected;
                }
                inner.emit(&conf, EventKind::InvoiceRejected, Some(invoice_id), Some(caller_addr), None);
                Ok(conf)
            }

            Operation::CreatePool {
                name: pool_name,
                invoice_ids,
                start_date,
                end_date,
            } => {
                inner.require_role(name, &caller_addr, Role::Admin)?;
                if invoice_ids.is_empty() {
                    return Err(rejected(name, "pool requires at least one invoice"));
                }
                if end_date <= start_date {
                    return Err(rejected(name, "end_date must be after start_date"));
                }
                let mut total = 0i64;
                for id in &invoice_ids {
                    let inv = inner
                        .invoices
                        .get(id)
                        .ok_or_else(|| rejected(name, format!("unknown invoice {id}")))?;
                    if inv.status != InvoiceStatus::Approved {
                        return Err(rejected(name, format!("invoice {id} is not approved")));
                    }
                    if inv.pool_id.is_some() {
                        return Err(rejected(name, format!("invoice {id} already pooled")));
                    }
                    total += inv.loan_amount;
                }

                let conf = inner.next_confirmation();
                let pool_id = inner.next_pool_id;
                inner.next_pool_id += 1;
                for id in &invoice_ids {
                    if let Some(inv) = inner.invoices.get_mut(id) {
                        inv.status = InvoiceStatus::InPool;
                        inv.pool_id = Some(pool_id);
                    }
                }
                inner.pools.insert(
                    pool_id,
                    Pool {
                        pool_id,
                        name: pool_name,
                        invoice_ids,
                        total_loan_amount: total,
                        amount_invested: 0,
                        amount_distributed: 0,
                        fee_paid: 0,
                        start_date,
                        end_date,
                        status: PoolStatus::Open,
                    },
                );
                inner.emit(&conf, EventKind::PoolCreated, Some(pool_id), Some(caller_addr), Some(total));
                Ok(conf)
            }

            Operation::Invest { pool_id, amount } => {
                inner.require_role(name, &caller_addr, Role::Investor)?;
                if amount <= 0 {
                    return Err(rejected(name, "amount must be positive"));
                }
                let (invested, total, status) = inner
                    .pools
                    .get(&pool_id)
                    .map(|p| (p.amount_invested, p.total_loan_amount, p.status))
                    .ok_or_else(|| rejected(name, format!("unknown pool {pool_id}")))?;
                if !matches!(
                    status,
                    PoolStatus::Open | PoolStatus::Fundraising | PoolStatus::PartiallyFunded
                ) {
                    return Err(rejected(name, format!("pool {pool_id} is not accepting investments")));
                }
                if invested + amount > total {
                    return Err(rejected(
                        name,
                        format!("contribution {amount} exceeds remaining capacity {}", total - invested),
                    ));
                }

                let conf = inner.next_confirmation();
                let now = inner.now;
                if let Some(pool) = inner.pools.get_mut(&pool_id) {
                    pool.amount_invested += amount;
                }
                let entry = inner
                    .investments
                    .entry((pool_id, caller_addr.clone()))
                    .or_insert(Investment {
                        pool_id,
                        investor: caller_addr.clone(),
                        amount: 0,
                        share_bps: 0,
                        first_contribution_at: now,
                        last_contribution_at: now,
                        returns_claimed: false,
                    });
                entry.amount += amount;
                entry.last_contribution_at = now;

                inner.recompute_shares(pool_id);
                inner.apply_allocation(pool_id, self.funding_threshold_pct);
                inner.emit(&conf, EventKind::Invested, Some(pool_id), Some(caller_addr), Some(amount));
                Ok(conf)
            }

            Operation::WithdrawFunds { invoice_id, amount } => {
                let invoice = inner
                    .invoices
                    .get(&invoice_id)
                    .cloned()
                    .ok_or_else(|| rejected(name, format!("unknown invoice {invoice_id}")))?;
                if invoice.exporter != caller_addr {
                    return Err(rejected(name, "only the invoice's exporter may withdraw"));
                }
                if !matches!(invoice.status, InvoiceStatus::Funded | InvoiceStatus::Withdrawn) {
                    return Err(rejected(name, format!("invoice {invoice_id} is not funded")));
                }
                let pool_id = invoice
                    .pool_id
                    .ok_or_else(|| rejected(name, "invoice has no pool"))?;
                let (pool_invested, pool_total) = inner
                    .pools
                    .get(&pool_id)
                    .map(|p| (p.amount_invested, p.total_loan_amount))
                    .ok_or_else(|| rejected(name, format!("unknown pool {pool_id}")))?;
                let available = calc::withdrawable(
                    &invoice,
                    pool_invested,
                    pool_total,
                    self.funding_threshold_pct,
                );
                if amount <= 0 || amount > available {
                    return Err(rejected(
                        name,
                        format!("amount {amount} exceeds withdrawable {available}"),
                    ));
                }

                let conf = inner.next_confirmation();
                if let Some(inv) = inner.invoices.get_mut(&invoice_id) {
                    inv.amount_withdrawn += amount;
                    inv.status = InvoiceStatus::Withdrawn;
                }
                inner.emit(&conf, EventKind::FundsWithdrawn, Some(invoice_id), Some(caller_addr), Some(amount));
                Ok(conf)
            }

            Operation::MarkInvoicePaid { invoice_id } => {
                inner.require_role(name, &caller_addr, Role::Admin)?;
                let status = inner
                    .invoices
                    .get(&invoice_id)
                    .map(|i| i.status)
                    .ok_or_else(|| rejected(name, format!("unknown invoice {invoice_id}")))?;
                if status != InvoiceStatus::Withdrawn {
                    return Err(rejected(
                        name,
                        format!("invoice {invoice_id} has no withdrawn funds to settle"),
                    ));
                }
                let conf = inner.next_confirmation();
                if let Some(inv) = inner.invoices.get_mut(&invoice_id) {
                    inv.status = InvoiceStatus::Paid;
                }
                inner.emit(&conf, EventKind::InvoicePaid, Some(invoice_id), Some(caller_addr), None);
                Ok(conf)
            }

            Operation::DistributeProfits { pool_id } => {
                inner.require_role(name, &caller_addr, Role::Admin)?;
                let pool = inner
                    .pools
                    .get(&pool_id)
                    .cloned()
                    .ok_or_else(|| rejected(name, format!("unknown pool {pool_id}")))?;
                if pool.status != PoolStatus::Funded {
                    return Err(rejected(name, format!("pool {pool_id} is not fully funded")));
                }
                for id in &pool.invoice_ids {
                    let paid = inner
                        .invoices
                        .get(id)
                        .is_some_and(|i| i.status == InvoiceStatus::Paid);
                    if !paid {
                        return Err(rejected(name, format!("invoice {id} is not paid yet")));
                    }
                }

                let total_payout: i64 = inner
                    .investments
                    .values()
                    .filter(|i| i.pool_id == pool_id)
                    .map(|i| calc::investor_payout(i.amount, self.yield_rate_bps))
                    .sum();
                let fee = (pool.amount_invested as i128 * self.fee_bps as i128 / 10_000) as i64;

                let conf = inner.next_confirmation();
                if let Some(p) = inner.pools.get_mut(&pool_id) {
                    p.amount_distributed = total_payout;
                    p.fee_paid = fee;
                    p.status = PoolStatus::Settling;
                }
                let member_ids = pool.invoice_ids.clone();
                for id in member_ids {
                    if let Some(inv) = inner.invoices.get_mut(&id) {
                        inv.status = InvoiceStatus::Completed;
                    }
                }
                inner.emit(&conf, EventKind::ProfitsDistributed, Some(pool_id), Some(caller_addr), Some(total_payout));
                Ok(conf)
            }

            Operation::ClaimReturns { pool_id } => {
                let status = inner
                    .pools
                    .get(&pool_id)
                    .map(|p| p.status)
                    .ok_or_else(|| rejected(name, format!("unknown pool {pool_id}")))?;
                if status != PoolStatus::Settling {
                    return Err(rejected(name, format!("pool {pool_id} is not settling")));
                }
                let key = (pool_id, caller_addr.clone());
                let claimed = inner
                    .investments
                    .get(&key)
                    .map(|i| i.returns_claimed)
                    .ok_or_else(|| rejected(name, format!("{caller_addr} has no investment in pool {pool_id}")))?;
                if claimed {
                    return Err(rejected(name, "returns already claimed"));
                }

                let conf = inner.next_confirmation();
                if let Some(i) = inner.investments.get_mut(&key) {
                    i.returns_claimed = true;
                }
                let all_claimed = inner
                    .investments
                    .values()
                    .filter(|i| i.pool_id == pool_id)
                    .all(|i| i.returns_claimed);
                if all_claimed {
                    if let Some(p) = inner.pools.get_mut(&pool_id) {
                        p.status = PoolStatus::Completed;
                    }
                }
                inner.emit(&conf, EventKind::ReturnsClaimed, Some(pool_id), Some(caller_addr), None);
                Ok(conf)
            }

            Operation::VerifyExporter { exporter } => {
                if !inner.has_role(&caller_addr, Role::Admin)
                    && !inner.has_role(&caller_addr, Role::Verifier)
                {
                    return Err(rejected(name, format!("{caller_addr} lacks role admin or verifier")));
                }
                let conf = inner.next_confirmation();
                inner.verified_exporters.insert(exporter.clone());
                inner.emit(&conf, EventKind::ExporterVerified, None, Some(exporter), None);
                Ok(conf)
            }

            Operation::GrantRole { address, role } => {
                inner.require_role(name, &caller_addr, Role::Admin)?;
                let conf = inner.next_confirmation();
                inner.roles.entry(address.clone()).or_default().insert(role);
                inner.emit(&conf, EventKind::RoleGranted, None, Some(address), None);
                Ok(conf)
            }
        }
    }

    async fn events_in_ledger(&self, ledger: u64) -> Result<Vec<LedgerEvent>> {
        let mut inner = self.inner.lock().await;
        inner.check_available()?;
        if inner.suppressed_event_polls > 0 {
            inner.suppressed_event_polls -= 1;
            return Ok(Vec::new());
        }
        Ok(inner
            .events
            .iter()
            .filter(|e| e.ledger == ledger)
            .cloned()
            .collect())
    }

    async fn get_invoice(&self, invoice_id: u64) -> Result<Invoice> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        inner
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or_else(|| rejected("get_invoice", format!("unknown invoice {invoice_id}")))
    }

    async fn get_pool(&self, pool_id: u64) -> Result<Pool> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        inner
            .pools
            .get(&pool_id)
            .cloned()
            .ok_or_else(|| rejected("get_pool", format!("unknown pool {pool_id}")))
    }

    async fn get_investment(&self, pool_id: u64, investor: &str) -> Result<Option<Investment>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner.investments.get(&(pool_id, investor.to_string())).cloned())
    }

    async fn get_investors(&self, pool_id: u64) -> Result<Vec<Investment>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let mut investments: Vec<Investment> = inner
            .investments
            .values()
            .filter(|i| i.pool_id == pool_id)
            .cloned()
            .collect();
        investments.sort_by(|a, b| {
            a.first_contribution_at
                .cmp(&b.first_contribution_at)
                .then_with(|| a.investor.cmp(&b.investor))
        });
        Ok(investments)
    }

    async fn get_exporter_invoices(&self, exporter: &str) -> Result<Vec<u64>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner
            .invoice_order
            .iter()
            .filter(|id| {
                inner
                    .invoices
                    .get(id)
                    .is_some_and(|i| i.exporter == exporter)
            })
            .copied()
            .collect())
    }

    async fn get_all_open_pools(&self) -> Result<Vec<u64>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let mut ids: Vec<u64> = inner
            .pools
            .values()
            .filter(|p| {
                matches!(
                    p.status,
                    PoolStatus::Open | PoolStatus::Fundraising | PoolStatus::PartiallyFunded
                )
            })
            .map(|p| p.pool_id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn get_all_pending_invoices(&self) -> Result<Vec<u64>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner
            .invoice_order
            .iter()
            .filter(|id| {
                inner
                    .invoices
                    .get(id)
                    .is_some_and(|i| i.status == InvoiceStatus::Pending)
            })
            .copied()
            .collect())
    }

    async fn get_all_approved_invoices(&self) -> Result<Vec<u64>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        Ok(inner
            .invoice_order
            .iter()
            .filter(|id| {
                inner
                    .invoices
                    .get(id)
                    .is_some_and(|i| i.status == InvoiceStatus::Approved)
            })
            .copied()
            .collect())
    }

    async fn get_pool_funding_percentage(&self, pool_id: u64) -> Result<i64> {
        let pool = self.get_pool(pool_id).await?;
        Ok(calc::funding_percentage(pool.amount_invested, pool.total_loan_amount))
    }

    async fn can_withdraw(&self, invoice_id: u64) -> Result<bool> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let invoice = inner
            .invoices
            .get(&invoice_id)
            .ok_or_else(|| rejected("can_withdraw", format!("unknown invoice {invoice_id}")))?;
        let Some(pool_id) = invoice.pool_id else {
            return Ok(false);
        };
        let Some(pool) = inner.pools.get(&pool_id) else {
            return Ok(false);
        };
        Ok(calc::withdrawable(
            invoice,
            pool.amount_invested,
            pool.total_loan_amount,
            self.funding_threshold_pct,
        ) > 0)
    }

    async fn get_roles(&self, address: &str) -> Result<Vec<Role>> {
        let inner = self.inner.lock().await;
        inner.check_available()?;
        let mut roles: Vec<Role> = inner
            .roles
            .get(address)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default();
        roles.sort_by_key(|r| r.as_str());
        Ok(roles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN: &str = "GADMIN";
    const EXPORTER: &str = "GEXPORTER";
    const INVESTOR: &str = "GINVESTOR";

    fn session(address: &str) -> SessionContext {
        SessionContext::new(address)
    }

    async fn ledger_with_actors() -> InMemoryLedger {
        let ledger = InMemoryLedger::with_admin(ADMIN);
        let admin = session(ADMIN);
        for (address, role) in [(EXPORTER, Role::Exporter), (INVESTOR, Role::Investor)] {
            ledger
                .submit(&admin, Operation::GrantRole { address: address.into(), role })
                .await
                .unwrap();
        }
        ledger
            .submit(&admin, Operation::VerifyExporter { exporter: EXPORTER.into() })
            .await
            .unwrap();
        ledger
    }

    fn create_invoice_op(shipping: i64, loan: i64) -> Operation {
        Operation::CreateInvoice {
            exporter_company: "Acme Exports".into(),
            importer_company: "Widget Imports".into(),
            importer_contact: "ops@widget.example".into(),
            shipping_amount: shipping,
            loan_amount: loan,
            shipping_date: 2_000_000_000,
            document_hash: "bafybeigdyrzt".into(),
        }
    }

    /// Approved invoice inside a pool; returns (invoice_id, pool_id).
    async fn pooled_invoice(ledger: &InMemoryLedger, shipping: i64, loan: i64) -> (u64, u64) {
        let admin = session(ADMIN);
        ledger
            .submit(&session(EXPORTER), create_invoice_op(shipping, loan))
            .await
            .unwrap();
        let invoice_id = *ledger
            .get_exporter_invoices(EXPORTER)
            .await
            .unwrap()
            .last()
            .unwrap();
        ledger
            .submit(&admin, Operation::ApproveInvoice { invoice_id })
            .await
            .unwrap();
        ledger
            .submit(
                &admin,
                Operation::CreatePool {
                    name: "Test Pool".into(),
                    invoice_ids: vec![invoice_id],
                    start_date: 1_700_000_000,
                    end_date: 1_800_000_000,
                },
            )
            .await
            .unwrap();
        let pool_id = ledger.get_invoice(invoice_id).await.unwrap().pool_id.unwrap();
        (invoice_id, pool_id)
    }

    #[tokio::test]
    async fn loan_cap_enforced_at_creation() {
        let ledger = ledger_with_actors().await;
        let err = ledger
            .submit(&session(EXPORTER), create_invoice_op(10_000, 8_001))
            .await
            .unwrap_err();
        match err {
            EngineError::LedgerRejected { operation, reason } => {
                assert_eq!(operation, "create_invoice");
                assert!(reason.contains("80%"), "{reason}");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        // At exactly 80% the creation passes.
        ledger
            .submit(&session(EXPORTER), create_invoice_op(10_000, 8_000))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unverified_exporter_is_rejected() {
        let ledger = InMemoryLedger::with_admin(ADMIN);
        ledger
            .submit(
                &session(ADMIN),
                Operation::GrantRole { address: EXPORTER.into(), role: Role::Exporter },
            )
            .await
            .unwrap();
        let err = ledger
            .submit(&session(EXPORTER), create_invoice_op(10_000, 8_000))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LedgerRejected { .. }));
    }

    #[tokio::test]
    async fn role_gating_surfaces_ledger_reason() {
        let ledger = ledger_with_actors().await;
        let err = ledger
            .submit(&session(INVESTOR), Operation::ApproveInvoice { invoice_id: 1 })
            .await
            .unwrap_err();
        match err {
            EngineError::LedgerRejected { reason, .. } => {
                assert!(reason.contains("lacks role admin"), "{reason}");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn investments_accumulate_and_match_pool_total() {
        let ledger = ledger_with_actors().await;
        let (_, pool_id) = pooled_invoice(&ledger, 12_500, 10_000).await;
        let investor = session(INVESTOR);

        ledger
            .submit(&investor, Operation::Invest { pool_id, amount: 2_000 })
            .await
            .unwrap();
        ledger
            .submit(&investor, Operation::Invest { pool_id, amount: 3_000 })
            .await
            .unwrap();

        // One growing record per investor, not two rows.
        let investment = ledger.get_investment(pool_id, INVESTOR).await.unwrap().unwrap();
        assert_eq!(investment.amount, 5_000);
        assert_eq!(investment.share_bps, 10_000);

        let pool = ledger.get_pool(pool_id).await.unwrap();
        let sum: i64 = ledger
            .get_investors(pool_id)
            .await
            .unwrap()
            .iter()
            .map(|i| i.amount)
            .sum();
        assert_eq!(sum, pool.amount_invested);
    }

    #[tokio::test]
    async fn over_capacity_contribution_is_rejected() {
        let ledger = ledger_with_actors().await;
        let (_, pool_id) = pooled_invoice(&ledger, 12_500, 10_000).await;
        let err = ledger
            .submit(&session(INVESTOR), Operation::Invest { pool_id, amount: 10_001 })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::LedgerRejected { .. }));
    }

    #[tokio::test]
    async fn threshold_crossing_funds_member_invoices() {
        let ledger = ledger_with_actors().await;
        let (invoice_id, pool_id) = pooled_invoice(&ledger, 12_500, 10_000).await;
        let investor = session(INVESTOR);

        ledger
            .submit(&investor, Operation::Invest { pool_id, amount: 6_900 })
            .await
            .unwrap();
        assert_eq!(ledger.get_pool(pool_id).await.unwrap().status, PoolStatus::Fundraising);
        assert_eq!(
            ledger.get_invoice(invoice_id).await.unwrap().status,
            InvoiceStatus::InPool
        );
        assert!(!ledger.can_withdraw(invoice_id).await.unwrap());

        ledger
            .submit(&investor, Operation::Invest { pool_id, amount: 100 })
            .await
            .unwrap();
        let pool = ledger.get_pool(pool_id).await.unwrap();
        assert_eq!(pool.status, PoolStatus::PartiallyFunded);
        let invoice = ledger.get_invoice(invoice_id).await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Funded);
        assert_eq!(invoice.amount_invested, 7_000);
        assert!(ledger.can_withdraw(invoice_id).await.unwrap());
    }

    #[tokio::test]
    async fn final_contribution_auto_funds_pool_in_same_operation() {
        let ledger = ledger_with_actors().await;
        let (invoice_id, pool_id) = pooled_invoice(&ledger, 12_500, 10_000).await;
        let investor = session(INVESTOR);

        ledger
            .submit(&investor, Operation::Invest { pool_id, amount: 9_500 })
            .await
            .unwrap();
        assert_eq!(
            ledger.get_pool(pool_id).await.unwrap().status,
            PoolStatus::PartiallyFunded
        );

        ledger
            .submit(&investor, Operation::Invest { pool_id, amount: 500 })
            .await
            .unwrap();
        let pool = ledger.get_pool(pool_id).await.unwrap();
        assert_eq!(pool.status, PoolStatus::Funded);
        assert_eq!(pool.amount_invested, 10_000);
        // Allocation landed on the member invoice within the same operation.
        assert_eq!(
            ledger.get_invoice(invoice_id).await.unwrap().amount_invested,
            10_000
        );
    }

    #[tokio::test]
    async fn unavailable_ledger_reports_transient_error() {
        let ledger = ledger_with_actors().await;
        ledger.set_unavailable(true).await;
        let err = ledger.get_invoice(1).await.unwrap_err();
        assert!(err.is_retryable());
        ledger.set_unavailable(false).await;
    }
}
