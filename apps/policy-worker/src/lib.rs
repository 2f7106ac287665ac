//! Policy Worker Service
//!
//! Consumes `ProcessPolicyCommand` messages, books each policy with the external
//! booking system and records the outcome.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (policy-processing-queue)
//!   ↓ (Consumer Group: queue_workers, peek-lock via pending entries)
//! QueueWorker<ProcessPolicyCommand, PolicyProcessor>
//!   ├─ transfer file  → FILE_OUTPUT_PATH
//!   ├─ booking system → BOOKING_SYSTEM_URL (bulkhead → breaker → retry → timeout)
//!   └─ outcome        → PostgreSQL (policies)
//! Redis Stream (policy-processing-queue:dlq)
//!   ↑ dead-lettered messages, watched by the DLQ monitor schedule
//! ```
//!
//! ## Features
//!
//! - At-least-once delivery with lock renewal while a handler runs
//! - Dead-lettering after the maximum delivery count
//! - Scheduled DLQ depth check and on-demand reprocessing through the admin API
//! - Graceful shutdown on SIGINT / SIGTERM

pub mod settings;

use axum::Router;
use core_config::{Environment, FromEnv};
use domain_policies::{
    BookingClientConfig, HttpBookingSystemClient, PgPolicyRepository, PolicyProcessor,
    ProcessPolicyCommand, TransferFileWriter,
};
use eyre::{Result, WrapErr};
use queue_worker::{
    admin_router, metrics, DlqMonitor, DlqReprocessor, HealthState, QueueBroker, QueueWorker,
    RedisBroker, RedisBrokerConfig, SenderCache, WorkerConfig,
};
use sea_orm::{ConnectOptions, Database};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::settings::WorkerSettings;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start the health and admin HTTP server
///
/// - Liveness: `/health`
/// - Readiness: `/ready`
/// - Prometheus metrics: `/metrics`
/// - DLQ admin: `/admin/dlq`, `/admin/dlq/reprocess`
async fn start_health_server(health_state: HealthState, address: String) -> Result<()> {
    let app: Router = admin_router(health_state);

    let listener = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", address))?;

    info!(address = %address, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Schedule the DLQ depth check
async fn start_dlq_schedule(monitor: DlqMonitor, cron: &str) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .wrap_err("Failed to create job scheduler")?;

    let job = Job::new_async(cron, move |_uuid, _scheduler| {
        let monitor = monitor.clone();
        Box::pin(async move {
            if let Err(e) = monitor.check().await {
                error!(error = %e, queue = %monitor.queue_name(), "Scheduled DLQ check failed");
            }
        })
    })
    .wrap_err_with(|| format!("Invalid DLQ monitor schedule '{}'", cron))?;

    scheduler
        .add(job)
        .await
        .wrap_err("Failed to register DLQ monitor job")?;
    scheduler
        .start()
        .await
        .wrap_err("Failed to start job scheduler")?;

    info!(schedule = %cron, "DLQ monitor scheduled");
    Ok(scheduler)
}

/// Run the policy worker
///
/// 1. Sets up error reports, structured logging and Prometheus metrics
/// 2. Loads settings and connects to PostgreSQL and Redis
/// 3. Starts the admin server and the DLQ monitor schedule
/// 4. Runs the worker until SIGINT / SIGTERM
///
/// # Errors
///
/// Returns an error if configuration is invalid, a backing service is
/// unreachable at startup, or the worker loop fails.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    info!(name = %APP_NAME, version = %APP_VERSION, "Starting policy worker service");
    info!("Environment: {:?}", environment);

    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;

    info!("Connecting to PostgreSQL...");
    let mut options = ConnectOptions::new(settings.database.url.clone());
    options.max_connections(settings.database.max_connections);
    let db = Database::connect(options)
        .await
        .wrap_err("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL successfully");

    info!("Connecting to Redis...");
    let broker = RedisBroker::connect(&settings.redis.url, RedisBrokerConfig::default())
        .await
        .wrap_err("Failed to connect to Redis")?;
    let senders = Arc::new(SenderCache::new(Arc::new(broker.clone())));
    let broker: Arc<dyn QueueBroker> = Arc::new(broker);

    let worker_config = WorkerConfig::new(settings.queue_name.clone())
        .with_max_concurrent_calls(settings.max_concurrent_calls)
        .with_max_delivery_count(settings.max_delivery_count)
        .with_max_lock_renewal(settings.max_lock_renewal);
    info!(
        queue = %worker_config.queue_name,
        max_concurrent_calls = %worker_config.max_concurrent_calls,
        max_delivery_count = %worker_config.max_delivery_count,
        max_lock_renewal_secs = %worker_config.max_lock_renewal.as_secs(),
        "Worker configuration loaded"
    );

    let repository = Arc::new(PgPolicyRepository::new(db));
    let client = HttpBookingSystemClient::new(
        BookingClientConfig::new(settings.booking_system_url.clone())
            .with_timeout(settings.booking_timeout),
    )
    .wrap_err("Failed to build booking system client")?;
    let files = TransferFileWriter::new(settings.file_output_path.clone());
    let processor = PolicyProcessor::new(repository.clone(), Arc::new(client), files);
    info!(output_dir = %settings.file_output_path.display(), "Policy processor initialized");

    let monitor = DlqMonitor::new(
        broker.clone(),
        settings.queue_name.clone(),
        settings.dlq_alert_threshold,
    );
    let reprocessor = DlqReprocessor::new(broker.clone(), senders, settings.queue_name.clone());

    let health_state = HealthState::new(
        broker.clone(),
        monitor.clone(),
        reprocessor,
        APP_NAME,
        APP_VERSION,
    )
    .with_check(repository);

    let address = settings.server.address();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, address).await {
            error!(error = %e, "Health server failed");
        }
    });

    let mut scheduler = start_dlq_schedule(monitor, &settings.dlq_monitor_cron).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    info!("Starting policy command processor...");
    let worker = QueueWorker::<ProcessPolicyCommand, _>::new(broker, processor, worker_config);
    let outcome = worker.run(shutdown_rx).await;

    if let Err(e) = scheduler.shutdown().await {
        warn!(error = %e, "Job scheduler did not shut down cleanly");
    }

    outcome.wrap_err("Worker stopped with an error")?;
    info!("Policy worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        let mut stream = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;
        stream.recv().await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
