mod billing;
mod config;
mod db;
mod errors;
mod models;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::billing::memory_store::MemoryBillingStore;
use crate::billing::pg_store::PgBillingStore;
use crate::billing::store::BillingStore;
use crate::billing::tiers::TierCatalog;
use crate::config::{Config, StoreBackend};
use crate::db::create_pool;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={level},billing::audit={level}",
                env!("CARGO_CRATE_NAME"),
                level = &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Entitlement API v{}", env!("CARGO_PKG_VERSION"));

    // Tier catalog is built once and never mutated
    let catalog = TierCatalog::load(config.tier_catalog_path.as_deref())?;
    info!("Tier catalog loaded ({} tiers)", catalog.len());

    let store: Arc<dyn BillingStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;
            let pool = create_pool(database_url, config.store_timeout).await?;
            Arc::new(PgBillingStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory billing store; state is lost on restart");
            Arc::new(MemoryBillingStore::new())
        }
    };

    let state = AppState::new(config.clone(), store, catalog);

    match config.sweep_interval {
        Some(every) => {
            state.sweeper().spawn(every);
            info!("Billing sweep scheduled every {}s", every.as_secs());
        }
        None => info!("Billing sweep disabled"),
    }

    // Build router
    let app = build_router(state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
