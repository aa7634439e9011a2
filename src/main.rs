//! Ledger worker daemon - main entry point.
//!
//! Runs the two background workers of the wallet core: the recovery
//! scheduler (deferred bank debits that pay the wallet back after a rail
//! fallback) and the refund sweeper (reconciliation of payments stuck in
//! uncertain failure states). Request-serving lives in a separate
//! deployment; this process only needs the database and the rail gateway.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create the database connection pool and run migrations
//! 3. Build the store, wallet mutator and provider clients
//! 4. Spawn both worker loops
//! 5. Run until SIGINT

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use wallet_ledger_core::services::notify_service::{LiveUpdates, NoopLiveUpdates, WebhookNotifier};
use wallet_ledger_core::{
    Config, PgStore, RecoveryWorker, RefundSweeper, WalletService, db,
    providers::http::HttpBankRail,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG, defaults to "info"
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let pool = db::create_pool(&config.database_url, config.max_connections).await?;
    tracing::info!("Database pool created");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let provider_timeout = Duration::from_secs(config.provider_timeout_secs);

    let store = Arc::new(PgStore::new(pool));
    let live: Arc<dyn LiveUpdates> = match &config.live_updates_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url,
            &config.provider_secret,
            provider_timeout,
        )?),
        None => Arc::new(NoopLiveUpdates),
    };
    let wallet = Arc::new(WalletService::new(store.clone(), live));
    let bank = Arc::new(HttpBankRail::new(
        &config.bank_rail_url,
        &config.provider_secret,
        provider_timeout,
    )?);

    let recovery = RecoveryWorker::new(
        store.clone(),
        wallet.clone(),
        bank.clone(),
        Duration::from_secs(config.recovery_poll_secs),
    );
    let sweeper = RefundSweeper::new(
        store,
        wallet,
        bank,
        chrono::Duration::hours(config.refund_grace_hours),
        Duration::from_secs(config.sweeper_poll_secs),
    );

    let recovery_handle = tokio::spawn(async move { recovery.run().await });
    let sweeper_handle = tokio::spawn(async move { sweeper.run().await });
    tracing::info!("Workers started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    recovery_handle.abort();
    sweeper_handle.abort();

    Ok(())
}
