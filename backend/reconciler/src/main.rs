//! Reconciler service — entry point.
//!
//! Runs the compensation worker against the configured JSON-RPC ledger
//! endpoint and exposes the projection read API over HTTP.

use std::sync::Arc;

use axum::{routing::get, Router};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reconciler::api;
use reconciler::compensation::CompensationWorker;
use reconciler::config::Config;
use reconciler::db;
use reconciler::rpc::RpcGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // HTTP client shared between the gateway and outbound compensation calls.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let gateway = Arc::new(RpcGateway::new(client.clone(), &config));

    // ─── Compensation worker ──────────────────────────────
    let shutdown = CancellationToken::new();
    let worker = CompensationWorker::new(pool.clone(), gateway, client, &config);
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { pool });

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/invoices", get(api::get_invoices))
        .route("/invoices/:id", get(api::get_invoice))
        .route("/pools", get(api::get_pools))
        .route("/pools/:id", get(api::get_pool))
        .route("/pools/:id/investments", get(api::get_pool_investments))
        .route("/compensation/abandoned", get(api::get_abandoned_tasks))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Let the worker finish its current sweep before exiting.
    shutdown.cancel();
    let _ = worker_handle.await;

    Ok(())
}
