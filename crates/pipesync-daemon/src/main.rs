//! Pipesync daemon - background CRM synchronization service
//!
//! This binary wires the whole stack together and runs it:
//! - loads configuration, opens the state database
//! - restores the persisted rate-budget window
//! - resumes any session a previous process left running
//! - runs the periodic incremental scheduler
//! - serves the HTTP control interface
//! - shuts down gracefully on SIGTERM/SIGINT, persisting the rate budget

mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pipesync_conflict::policy::ConflictPolicy;
use pipesync_conflict::resolver::ConflictResolver;
use pipesync_core::config::Config;
use pipesync_core::ports::remote_crm::IRemoteCrm;
use pipesync_core::ports::state_repository::IStateRepository;
use pipesync_engine::{SyncOrchestrator, SyncScheduler};
use pipesync_remote::{CrmHttpClient, CrmProvider, RateBudget};
use pipesync_store::{DatabasePool, SqliteStateRepository};

/// How long shutdown waits for the active session to stop at a chunk
/// boundary before exiting anyway
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Parser)]
#[command(name = "pipesyncd", about = "Pipesync CRM synchronization daemon", version)]
struct Args {
    /// Path to the configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!(config_path = %config_path.display(), "pipesyncd starting");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let result = run(config, shutdown).await;
    match &result {
        Ok(()) => info!("pipesyncd shut down gracefully"),
        Err(e) => error!(error = %e, "pipesyncd exiting with error"),
    }
    result
}

async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    // --- State store ---
    let db_pool = DatabasePool::new(&config.store.db_path)
        .await
        .context("opening state database")?;
    let repository: Arc<dyn IStateRepository + Send + Sync> =
        Arc::new(SqliteStateRepository::new(db_pool.pool().clone()));

    // --- Rate budget, restored across restarts ---
    let budget = Arc::new(RateBudget::new(
        config.rate_budget.window_limit,
        Duration::from_secs(config.rate_budget.window_secs),
        config.rate_budget.low_water_percent,
        Duration::from_millis(config.rate_budget.pacing_delay_ms),
    ));
    if let Some(snapshot) = repository
        .load_rate_budget()
        .await
        .context("loading rate budget snapshot")?
    {
        budget.restore(&snapshot);
    }

    // --- Remote CRM adapter ---
    let client = CrmHttpClient::new(
        config.remote.base_url.clone(),
        config.remote.api_token.clone(),
        Duration::from_secs(config.remote.request_timeout_secs),
    )
    .context("building CRM client")?
    .with_budget(Arc::clone(&budget));
    let remote: Arc<dyn IRemoteCrm + Send + Sync> = Arc::new(CrmProvider::new(
        client,
        Arc::clone(&budget),
        config.field_mapping(),
        config.sync.page_size,
        Duration::from_secs(config.rate_budget.acquire_timeout_secs),
    ));

    // --- Engine ---
    let policy: ConflictPolicy = config.conflicts.default_policy.parse()?;
    let orchestrator = SyncOrchestrator::new(
        Arc::clone(&remote),
        Arc::clone(&repository),
        policy,
        config.mapping.version,
        config.remote.push_batch_size as usize,
    );

    match orchestrator.resume().await {
        Ok(Some(session_id)) => info!(%session_id, "resumed interrupted session"),
        Ok(None) => {}
        Err(e) => warn!(error = %e, "failed to resume interrupted session"),
    }

    // --- Control interface ---
    let resolver = ConflictResolver::new(Arc::clone(&remote), Arc::clone(&repository));
    let state = Arc::new(http::AppState {
        orchestrator: orchestrator.clone(),
        resolver,
        repository: Arc::clone(&repository),
    });
    let control = http::ControlServer::new(state, &config.control.listen_addr)
        .context("binding control interface")?;
    let control_token = shutdown.clone();
    let control_task = tokio::spawn(async move {
        if let Err(e) = control.run(control_token).await {
            error!(error = %e, "control interface failed");
        }
    });

    // --- Scheduler ---
    let scheduler = SyncScheduler::new(
        orchestrator.clone(),
        Duration::from_secs(config.sync.interval_secs),
        shutdown.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    shutdown.cancelled().await;
    info!("shutdown requested");

    // Stop the active session at its next chunk boundary
    if let Ok(Some(active)) = repository.find_active_session().await {
        let session_id = *active.id();
        if orchestrator.cancel(&session_id).await.is_ok() {
            let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
            while tokio::time::Instant::now() < deadline {
                match repository.find_active_session().await {
                    Ok(Some(_)) => tokio::time::sleep(Duration::from_millis(100)).await,
                    _ => break,
                }
            }
        }
    }

    // Persist the rate budget so a restart cannot mint a fresh window
    if let Err(e) = repository.save_rate_budget(&budget.snapshot()).await {
        warn!(error = %e, "failed to persist rate budget snapshot");
    }

    let _ = scheduler_task.await;
    let _ = control_task.await;
    Ok(())
}

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }

    token.cancel();
}
