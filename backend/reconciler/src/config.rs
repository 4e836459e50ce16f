//! Application configuration loaded from environment variables.

use crate::errors::{EngineError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Ledger JSON-RPC endpoint
    pub rpc_url: String,
    /// The financing contract address on the ledger
    pub contract_id: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Fixed investor yield rate in basis points (400 = 4%)
    pub yield_rate_bps: i64,
    /// Pool funding percentage at which exporters may begin withdrawing
    pub funding_threshold_pct: i64,
    /// Price of one native-token unit in USD cents, used only for
    /// UI-facing eligibility figures.  A pinned approximation, not a feed.
    pub native_price_usd_cents: i64,
    /// How many times the event resolver polls before running its fallback
    pub resolver_max_attempts: u32,
    /// Delay between resolver polls, in milliseconds
    pub resolver_delay_ms: u64,
    /// How long `submit` waits for inclusion before giving up, in seconds
    pub submit_timeout_secs: u64,
    /// Delay between inclusion polls, in milliseconds
    pub submit_poll_ms: u64,
    /// Compensation worker wake-up interval, in seconds
    pub worker_interval_secs: u64,
    /// Attempts before a compensation task is abandoned
    pub max_task_attempts: i64,
    /// Document-store unpin endpoint for cleanup tasks (optional)
    pub ipfs_unpin_url: Option<String>,
    /// Static admin allow-list, cross-checked against the ledger role registry
    pub admin_allowlist: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL")
                .unwrap_or_else(|_| "https://ledger-testnet.example.org".to_string()),
            contract_id: env_var("CONTRACT_ID").map_err(|_| {
                EngineError::Config("CONTRACT_ID environment variable is required".to_string())
            })?,
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./reconciler.db".to_string()),
            api_port: parse_var("API_PORT", "3001")?,
            yield_rate_bps: parse_var("YIELD_RATE_BPS", "400")?,
            funding_threshold_pct: parse_var("FUNDING_THRESHOLD_PCT", "70")?,
            native_price_usd_cents: parse_var("NATIVE_PRICE_USD_CENTS", "12")?,
            resolver_max_attempts: parse_var("RESOLVER_MAX_ATTEMPTS", "3")?,
            resolver_delay_ms: parse_var("RESOLVER_DELAY_MS", "1000")?,
            submit_timeout_secs: parse_var("SUBMIT_TIMEOUT_SECS", "60")?,
            submit_poll_ms: parse_var("SUBMIT_POLL_MS", "500")?,
            worker_interval_secs: parse_var("WORKER_INTERVAL_SECS", "5")?,
            max_task_attempts: parse_var("MAX_TASK_ATTEMPTS", "5")?,
            ipfs_unpin_url: env_var("IPFS_UNPIN_URL").ok(),
            admin_allowlist: env_var("ADMIN_ALLOWLIST")
                .map(|s| {
                    s.split(',')
                        .map(|a| a.trim().to_string())
                        .filter(|a| !a.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("Missing env var: {key}")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| EngineError::Config(format!("Invalid {key}")))
}
