//! Reconciliation engine for on-chain invoice financing.
//!
//! The ledger is the single source of truth for balances, statuses and
//! ownership; SQLite holds read-optimized projections of confirmed state.
//! This crate submits operations, waits for inclusion, resolves
//! ledger-assigned identifiers, validates lifecycle transitions, projects
//! post-state into the store, and compensates when a projection cannot be
//! applied synchronously.

pub mod api;
pub mod calc;
pub mod compensation;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod flows;
pub mod gateway;
pub mod lifecycle;
pub mod projector;
pub mod resolver;
pub mod rpc;
pub mod session;
pub mod types;
