//! Caller session context.
//!
//! An explicit value passed into every flow — there is no ambient or global
//! role cache.  Roles are refreshed by an explicit [`SessionContext::refresh`]
//! call against the ledger's role registry; admin additionally requires
//! membership in the statically configured allow-list.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::Result;
use crate::gateway::LedgerGateway;

/// Roles recognised by the financing contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Exporter,
    Investor,
    Verifier,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Exporter => "exporter",
            Self::Investor => "investor",
            Self::Verifier => "verifier",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "exporter" => Some(Self::Exporter),
            "investor" => Some(Self::Investor),
            "verifier" => Some(Self::Verifier),
            _ => None,
        }
    }
}

/// The caller's signing identity and ledger-confirmed role set.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub address: String,
    roles: HashSet<Role>,
}

impl SessionContext {
    /// A session with no confirmed roles yet.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            roles: HashSet::new(),
        }
    }

    /// Re-read this identity's roles from the ledger.
    ///
    /// The ledger remains authoritative for every role check it performs
    /// itself; this copy only short-circuits doomed submissions.  Admin is
    /// honoured only when the ledger grant is backed by the static
    /// allow-list, so a stray on-chain grant cannot widen operator access.
    pub async fn refresh<G: LedgerGateway>(
        &mut self,
        gateway: &G,
        admin_allowlist: &[String],
    ) -> Result<()> {
        let mut roles: HashSet<Role> = gateway.get_roles(&self.address).await?.into_iter().collect();
        if roles.contains(&Role::Admin) && !admin_allowlist.iter().any(|a| a == &self.address) {
            warn!(
                address = %self.address,
                "ledger grants admin but address is not in the configured allow-list; ignoring"
            );
            roles.remove(&Role::Admin);
        }
        self.roles = roles;
        Ok(())
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(Role::Admin)
    }
}
