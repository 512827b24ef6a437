//! Relay agent - main entry point
//!
//! Runs one polling agent: leases shards, relays outbox events to the
//! configured index backend and serves the admin API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use relay_core::{
    api::{self, AdminState},
    clock::{SharedClock, SystemClock},
    config::Config,
    dispatch::Dispatcher,
    health::{
        EventLogHealthChecker, HealthService, IndexHealthChecker, LeaseHealthChecker,
        SchedulerHealthChecker,
    },
    lease::{InMemoryLeaseStore, LeaseManager, LeaseStore, PgLeaseStore},
    outbox::{InMemoryOutboxStore, OutboxStore, PgOutboxStore},
    scheduler::RelayScheduler,
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "relay-agent", version, about = "Outbox relay agent")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Agent name shown in the registry
    #[arg(short, long, env = "RELAY_AGENT_NAME")]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(name) = args.name {
        config.agent.name = name;
    }

    let telemetry = telemetry::init_telemetry(&config.telemetry)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        agent = %config.agent.name,
        shards = config.lease.shard_count,
        "Starting relay agent"
    );

    let clock: SharedClock = Arc::new(SystemClock);
    let (outbox, leases) = open_stores(&config, clock.clone()).await?;

    let writer = config.index.build_writer()?;
    tracing::info!(backend = %writer.name(), "Index backend ready");

    let manager = Arc::new(LeaseManager::new(
        config.agent.name.clone(),
        leases.clone(),
        clock.clone(),
        config.lease.clone(),
    ));
    let scheduler = Arc::new(RelayScheduler::new(
        manager.clone(),
        outbox.clone(),
        Dispatcher::new(writer, config.dispatch.clone(), clock.clone()),
        config.retry.clone(),
        config.poll.clone(),
        clock.clone(),
    ));

    let shutdown = CancellationToken::new();

    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move {
            let result = scheduler.run(shutdown.clone()).await;
            // A scheduler that stops on its own takes the process down with it.
            shutdown.cancel();
            result
        }
    });

    let admin_task = if config.admin.enabled {
        let health = HealthService::new(config.telemetry.service_name.clone(), config.admin.health_check_timeout)
            .with_checker(Arc::new(EventLogHealthChecker::new(outbox.clone(), clock.clone())))
            .with_checker(Arc::new(LeaseHealthChecker::new(manager.clone(), clock.clone())))
            .with_checker(Arc::new(SchedulerHealthChecker::new(scheduler.clone(), clock.clone())))
            .with_checker(Arc::new(IndexHealthChecker::new(scheduler.clone())));

        let state = AdminState {
            outbox: outbox.clone(),
            leases: leases.clone(),
            health: Arc::new(health),
            metrics: telemetry.metrics.clone(),
            clock: clock.clone(),
        };

        let addr: SocketAddr = format!("{}:{}", config.admin.host, config.admin.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        Some(tokio::spawn(api::serve(listener, state, shutdown.clone())))
    } else {
        None
    };

    tokio::select! {
        _ = shutdown_signal() => shutdown.cancel(),
        _ = shutdown.cancelled() => {}
    }

    match scheduler_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Scheduler stopped with an error"),
        Err(e) => tracing::error!(error = %e, "Scheduler task panicked"),
    }
    if let Some(task) = admin_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Admin API stopped with an error"),
            Err(e) => tracing::error!(error = %e, "Admin API task panicked"),
        }
    }

    telemetry.shutdown();
    tracing::info!("Relay agent shutdown complete");
    Ok(())
}

/// Postgres stores when a database URL is configured, in-memory otherwise.
async fn open_stores(
    config: &Config,
    clock: SharedClock,
) -> anyhow::Result<(Arc<dyn OutboxStore>, Arc<dyn LeaseStore>)> {
    let shard_count = config.lease.shard_count;

    let Some(url) = &config.database.url else {
        tracing::warn!("No database configured, running on in-memory stores");
        let leases = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let outbox = Arc::new(InMemoryOutboxStore::new(shard_count, leases.clone(), clock));
        return Ok((outbox, leases));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(config.database.acquire_timeout)
        .connect(url)
        .await?;
    tracing::info!("Connected to database");

    let leases = PgLeaseStore::new(pool.clone(), clock.clone());
    leases.initialize().await?;
    let outbox = PgOutboxStore::new(pool, shard_count, clock);
    outbox.initialize().await?;
    tracing::info!("Relay tables ready");

    Ok((Arc::new(outbox), Arc::new(leases)))
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
