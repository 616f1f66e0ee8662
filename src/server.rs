//! Service bootstrap for the fiscal registry.
//!
//! This module wires together:
//! - configuration
//! - database connection pool (and optional migrations)
//! - certificate custody, transport client and registry manager
//! - the submission worker and graceful shutdown

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::custody::{CustodyConfig, CustodyService};
use crate::document::QrConfig;
use crate::infra::{
    is_retryable_db_error, shutdown_signal, BackoffPolicy, PgInvoiceSource, PgRegistryStore,
    Retry, RetryConfig, ShutdownCoordinator, TracingNotifier,
};
use crate::metrics::MetricsRegistry;
use crate::registry::RegistryManager;
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use crate::transport::{HttpTransport, TransportConfig};
use crate::worker::{spawn_worker, SubmissionWorker, WorkerConfig, WorkerMessage};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Apply embedded migrations before starting the worker.
    pub migrate_on_startup: bool,
    /// How long in-flight submissions may take to finish on shutdown.
    pub drain_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/fiscal_registry".to_string());

        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        let migrate_on_startup = std::env::var("DB_MIGRATE_ON_STARTUP")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let drain_timeout = std::env::var("SHUTDOWN_DRAIN_TIMEOUT_SECS")
            .ok()
            .and_then(|p| p.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Self {
            database_url,
            max_connections,
            migrate_on_startup,
            drain_timeout,
        }
    }
}

/// Connect to Postgres, retrying transient failures.
pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let retry = Retry::new(RetryConfig::database());
    let pool = retry
        .run_with_context(
            "connect_database",
            || {
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url)
            },
            is_retryable_db_error,
        )
        .await
        .into_result()?;
    Ok(pool)
}

/// Run the submission service until SIGINT/SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    let telemetry = TelemetryConfig::from_env();
    init_telemetry(&telemetry)?;

    info!("Starting Fiscal Registry v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    let pool = connect(&config.database_url, config.max_connections).await?;
    if config.migrate_on_startup {
        crate::migrations::run_postgres(&pool).await?;
        info!("Database migrations applied");
    }

    let store = Arc::new(PgRegistryStore::new(pool.clone()));
    let invoices = Arc::new(PgInvoiceSource::new(pool));
    let metrics = Arc::new(MetricsRegistry::new());

    // Refuses to start without a master key.
    let custody = Arc::new(CustodyService::with_fs_vault(
        CustodyConfig::from_env()?,
        store.clone(),
    ));
    let transport = Arc::new(HttpTransport::new(TransportConfig::from_env()?));

    let registry = Arc::new(
        RegistryManager::new(
            store,
            invoices,
            Arc::new(TracingNotifier),
            BackoffPolicy::from_env()?,
            QrConfig::from_env()?,
        )
        .with_metrics(metrics.clone()),
    );

    let coordinator = ShutdownCoordinator::new();
    let worker = SubmissionWorker::new(
        WorkerConfig::from_env(),
        registry,
        custody,
        transport,
        &coordinator,
    );
    let (handle, control) = spawn_worker(worker);

    // Certificate check once at startup, then on the housekeeping timer.
    let _ = control.send(WorkerMessage::CheckCertificates).await;
    info!("Fiscal Registry worker is running");

    shutdown_signal().await;
    info!("Shutdown signal received");

    let drained = coordinator.graceful_shutdown(config.drain_timeout).await;
    if !drained {
        tracing::warn!("In-flight submissions did not finish before the drain timeout");
    }
    let _ = control.send(WorkerMessage::Shutdown).await;
    if let Err(e) = handle.await {
        tracing::error!(error = %e, "Submission worker task failed");
    }

    info!(metrics = %metrics.to_json().await, "Final metrics");
    shutdown_telemetry();
    Ok(())
}
