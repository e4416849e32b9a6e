use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crucible::api::{build_router, AppState};
use crucible::bridge::Bridge;
use crucible::config::Config;
use crucible::guard::{Guard, GuardConfig};
use crucible::session::{ProviderRegistry, ProviderSpec, SessionManager};
use crucible::store::{Store, StoreHandle};
use crucible::team::{
    ConflictDetector, DigestBuilder, IntentResolver, PermissionBroker, Supervisor,
    SupervisorConfig, WorkerManager,
};
use crucible::workflow::{BudgetGovernor, Engine, GateRegistry};

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Gated seven-phase review workflow engine for code agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and serve the flow API
    Serve {
        /// Path to the JSON configuration file
        #[arg(long, default_value = "crucible.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(&config).await,
    }
}

async fn serve(config_path: &std::path::Path) -> Result<()> {
    let config = Config::load(config_path)?;

    let store = StoreHandle::new(
        Store::open(std::path::Path::new(&config.db_path)).context("open store")?,
    );

    // Workflow engine.
    let governor = BudgetGovernor::new(store.clone());
    let gates = Arc::new(GateRegistry::with_default(governor.clone()));
    let engine = Engine::new(store.clone(), gates);

    // Team management.
    let broker = PermissionBroker::new(store.clone());
    let manager = WorkerManager::new(store.clone(), config.max_concurrent_workers);
    let supervisor = Arc::new(Supervisor::new(
        store.clone(),
        manager.clone(),
        SupervisorConfig {
            check_interval_sec: config.check_interval_sec,
            heartbeat_max_age: config.heartbeat_max_age,
        },
    ));

    // Provider registry.
    let registry = Arc::new(ProviderRegistry::new());
    for (name, provider) in &config.providers {
        registry
            .register(ProviderSpec {
                name: name.clone(),
                command: provider.command.clone(),
                args: provider.args.clone(),
                env: provider.env.clone(),
            })
            .with_context(|| format!("register provider {name}"))?;
    }

    // Session manager, guard, and bridge.
    let sessions = Arc::new(SessionManager::new(registry));
    let guard = Arc::new(Guard::new(
        store.clone(),
        governor.clone(),
        broker,
        GuardConfig {
            max_rounds: config.max_rounds,
            rate_limit_per_minute: config.rate_limit_per_minute,
        },
    ));
    let bridge = Arc::new(Bridge::new(
        sessions.clone(),
        guard.clone(),
        governor,
        store.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Resume supervision for flows that were running when the process
    // last stopped.
    let running = store.call(|s| s.list_running_tasks()).await?;
    for flow in &running {
        supervisor.start_monitoring(flow.task_id.clone(), shutdown.clone());
    }
    if !running.is_empty() {
        tracing::info!(count = running.len(), "resumed supervision for running flows");
    }

    let state = Arc::new(AppState {
        engine,
        guard,
        store: store.clone(),
        manager,
        supervisor: supervisor.clone(),
        resolver: IntentResolver::new(store.clone()),
        conflicts: ConflictDetector::new(store.clone()),
        digests: DigestBuilder::new(store),
        bridge,
        workspace: config.workspace.clone(),
        shutdown: shutdown.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "engine listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("serve")?;

    // Cancel background loops, stop supervision, and reap every provider
    // process before exit.
    shutdown.cancel();
    supervisor.stop_monitoring();
    sessions.stop_all().await;
    tracing::info!("engine stopped");
    Ok(())
}
