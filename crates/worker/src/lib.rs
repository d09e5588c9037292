//! Loyalty order reconciliation worker.

pub mod config;

use std::sync::Arc;

use anyhow::{Context, bail};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use loyalty_infra::accrual::HttpAccrualClient;
use loyalty_infra::reconciliation::{ReconciliationController, Shutdown};
use loyalty_infra::store::PostgresOrderStore;

pub use config::Cli;

/// Connect to Postgres and the accrual service, then reconcile orders until
/// Ctrl-C or a hard pipeline failure.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli
        .reconciler_config()
        .context("invalid reconciler configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(pool_size(config.max_concurrent))
        .connect(&cli.database_uri)
        .await
        .context("failed to connect to database")?;

    let store = Arc::new(PostgresOrderStore::new(pool));
    store
        .ensure_schema()
        .await
        .context("failed to create database schema")?;

    let accrual = Arc::new(
        HttpAccrualClient::new(&cli.accrual_address, config.request_timeout)
            .context("failed to build accrual client")?,
    );
    info!(accrual = %accrual.base_url(), "accrual service configured");

    let handle = ReconciliationController::new(store, accrual, config)?.start(Shutdown::new());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
        }
        failure = handle.failed() => {
            error!(failure = %failure, "stopping after pipeline failure");
        }
    }

    let report = handle.shutdown().await;
    info!(stats = ?report.stats, "reconciliation stopped");

    if let Some(failure) = report.first_failure {
        bail!("reconciliation pipeline failed: {failure}");
    }
    Ok(())
}

/// One connection per concurrent worker plus headroom for the poller.
fn pool_size(max_concurrent: usize) -> u32 {
    u32::try_from(max_concurrent)
        .unwrap_or(u32::MAX)
        .saturating_add(2)
}
