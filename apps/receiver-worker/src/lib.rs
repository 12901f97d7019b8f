//! Receiver Worker Service
//!
//! A background worker that drives one transactional receiver.
//!
//! ## Architecture
//!
//! ```text
//! In-memory queue (QueueListener)
//!   ↓ (poll workers, optional fetch semaphore)
//! Receiver<QueueListener>
//!   ↓ (pipeline inside a transaction)
//! LoggingPipeline
//!   ↓ (on repeated failure)
//! Error storage (quarantine) + poison cache
//! ```
//!
//! ## Features
//!
//! - Configuration from `RECEIVER_*` environment variables
//! - Exponential back-off on listener failures
//! - Quarantine of messages that keep failing
//! - Graceful shutdown handling
//! - Health and metrics endpoints for Kubernetes probes

use async_trait::async_trait;
use axum::Router;
use core_config::{env_optional, env_parse, Environment, FromEnv};
use eyre::{eyre, Result, WrapErr};
use receiver::{
    health_router, metrics, HealthState, InMemoryMessageStore, ListenerRegistry, MessageContext, Pipeline,
    PipelineError, PipelineResult, QueueListener, QueuedMessage, Receiver, ReceiverConfig,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_HEALTH_PORT: u16 = 8083;

/// Pipeline that logs each message and fails payloads containing "fail"
#[derive(Debug, Default)]
pub struct LoggingPipeline;

#[async_trait]
impl Pipeline for LoggingPipeline {
    async fn process(
        &self,
        correlation_id: &str,
        payload: &str,
        ctx: &mut MessageContext,
    ) -> Result<PipelineResult, PipelineError> {
        info!(
            correlation_id,
            retry = ctx.is_retry(),
            bytes = payload.len(),
            "Processing message"
        );
        if payload.contains("fail") {
            return Err(PipelineError::failed(format!("payload rejected: {}", payload)));
        }
        Ok(PipelineResult::success(format!("processed {} bytes", payload.len())))
    }

    fn name(&self) -> &'static str {
        "LoggingPipeline"
    }
}

/// Health server port.
///
/// Checks RECEIVER_WORKER_HEALTH_PORT first, then HEALTH_PORT, then the default.
pub fn health_port() -> u16 {
    env_optional("RECEIVER_WORKER_HEALTH_PORT")
        .or_else(|| env_optional("HEALTH_PORT"))
        .and_then(|port| port.parse().ok())
        .unwrap_or(DEFAULT_HEALTH_PORT)
}

/// Queue `count` demo messages; every fifth one is made to fail
pub fn seed_messages(listener: &QueueListener, count: usize) {
    for i in 1..=count {
        let payload = if i % 5 == 0 {
            format!("{{\"order\":{},\"action\":\"fail\"}}", i)
        } else {
            format!("{{\"order\":{},\"action\":\"create\"}}", i)
        };
        listener.send(QueuedMessage::new(format!("demo-{}", i), payload).with_correlation_id(format!("order-{}", i)));
    }
}

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Receiver monitoring: `/receivers`, `/receivers/{name}/errors`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the receiver worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads the receiver configuration from the environment
/// 3. Builds the receiver over an in-memory queue and stores
/// 4. Starts the receiver with graceful shutdown handling
///
/// # Errors
///
/// Returns an error if:
/// - The receiver configuration is invalid
/// - The receiver fails to start
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    // Initialize tracing (env-aware: JSON for prod, pretty for dev)
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    // Initialize Prometheus metrics
    metrics::init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = %app_name, version = %app_version, "Starting receiver worker service");
    info!("Environment: {:?}", environment);

    let config = ReceiverConfig::from_env().wrap_err("Failed to load receiver configuration")?;
    let stop_timeout = config.stop_timeout;
    info!(
        receiver = %config.name,
        mode = %config.mode,
        num_threads = config.num_threads,
        num_threads_polling = config.num_threads_polling,
        transaction_attribute = %config.transaction_attribute,
        max_retries = ?config.max_retries,
        "Receiver configuration loaded"
    );

    let listener = QueueListener::new(format!("{}-queue", config.name));
    let seed: usize = env_parse("RECEIVER_WORKER_SEED_MESSAGES", 10).wrap_err("Invalid seed message count")?;
    seed_messages(&listener, seed);
    info!(count = seed, "Seeded demo messages");

    let error_storage = InMemoryMessageStore::new(format!("{}-errors", config.name));
    let message_log = InMemoryMessageStore::new(format!("{}-log", config.name));
    let receiver = Receiver::builder(config, listener, Arc::new(LoggingPipeline))
        .with_error_storage(Arc::new(error_storage))
        .with_message_log(Arc::new(message_log))
        .build();

    let registry = Arc::new(ListenerRegistry::new());
    registry
        .register(Arc::new(receiver.clone()))
        .wrap_err("Failed to register receiver")?;

    // Set up a shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    // Start health server in background
    let health_state = HealthState::new(registry.clone(), app_name, app_version);
    let port = health_port();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let failures = registry.start_all().await;
    if let Some((name, e)) = failures.into_iter().next() {
        return Err(eyre!("Failed to start receiver '{}': {}", name, e));
    }

    shutdown_rx
        .changed()
        .await
        .wrap_err("Shutdown channel closed")?;

    info!("Stopping receivers...");
    let lagging = registry.stop_all(stop_timeout).await;
    if !lagging.is_empty() {
        warn!(receivers = ?lagging, "Receivers did not stop in time");
    }

    let stats = receiver.statistics();
    info!(
        received = stats.received,
        retried = stats.retried,
        rejected = stats.rejected,
        quarantined = stats.quarantined,
        "Receiver worker service stopped"
    );
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
