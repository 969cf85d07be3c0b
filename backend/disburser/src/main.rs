//! Pool disburser entry point.
//!
//! Negotiates interactive Open Payments grants that let a funder authorize a
//! bounded pool of spend, then draws that pool down one disbursement at a
//! time. Grant state lives in SQLite; the REST API drives every step.

mod api;
mod callback;
mod config;
mod db;
mod disbursement;
mod errors;
mod finalize;
mod funding;
mod grant;
mod lock;
mod open_payments;
mod store;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::SqliteGrantStore;
use open_payments::OpenPaymentsClient;
use store::{GrantStore, InMemoryGrantStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let store: Arc<dyn GrantStore> = if config.database_url == "memory" {
        warn!("DATABASE_URL=memory: pool grants are lost when the process exits");
        Arc::new(InMemoryGrantStore::new())
    } else {
        // Set up the SQLite connection pool and run migrations.
        let pool = db::init_pool(&config.database_url).await?;
        Arc::new(SqliteGrantStore::new(pool))
    };

    let client = Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;
    let auth = Arc::new(OpenPaymentsClient::new(
        client,
        config.client_wallet_address.clone(),
    ));

    let api_state = Arc::new(api::ApiState::new(store, auth, &config));

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");
    match &config.service_url {
        Some(service_url) => info!("Default callback base: {service_url}"),
        None => info!("No SERVICE_URL; grants without a callback_uri are polled"),
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
