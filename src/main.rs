//! vm-orchestrator server entry point.
//!
//! Connects to the control plane, starts the event monitor and maintenance
//! tasks, and serves the REST and WebSocket endpoints until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use vm_orchestrator::api;
use vm_orchestrator::app_state::AppState;
use vm_orchestrator::config::OrchestratorConfig;
use vm_orchestrator::control_plane::{ControlPlane, SimulatedControlPlane};
use vm_orchestrator::domain::{EventBus, SnapshotRegistry, VmStateStore};
use vm_orchestrator::persistence::{
    CheckpointStore, MemoryCheckpointStore, PostgresCheckpointStore,
};
use vm_orchestrator::service::maintenance::{spawn_reconciler, spawn_tombstone_purger};
use vm_orchestrator::service::{EventMonitor, LifecycleOrchestrator, MonitorSettings, VmLocks};
use vm_orchestrator::ws::handler::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = OrchestratorConfig::from_env()
        .map_err(|err| anyhow::anyhow!("invalid configuration: {err}"))?;
    tracing::info!(addr = %config.listen_addr, "starting vm-orchestrator");

    // Control plane
    let simulator = if config.simulator_seed {
        SimulatedControlPlane::with_default_inventory()
    } else {
        SimulatedControlPlane::new()
    };
    let control_plane: Arc<dyn ControlPlane> = Arc::new(simulator);
    control_plane
        .connect()
        .await
        .context("connecting to control plane")?;

    // Checkpoints
    let checkpoints: Arc<dyn CheckpointStore> = if config.persistence_enabled {
        let store = PostgresCheckpointStore::connect(
            &config.database_url,
            config.database_max_connections,
            std::time::Duration::from_secs(config.database_connect_timeout_secs),
        )
        .await
        .context("opening checkpoint database")?;
        tracing::info!("event checkpoints stored in PostgreSQL");
        Arc::new(store)
    } else {
        Arc::new(MemoryCheckpointStore::new())
    };

    // Build domain layer
    let event_bus = EventBus::new(config.event_bus_capacity);
    let store = Arc::new(VmStateStore::new(event_bus.clone(), config.tombstone_grace()));
    let snapshots = Arc::new(SnapshotRegistry::new(event_bus.clone()));
    let locks = Arc::new(VmLocks::new(config.lock_wait_timeout()));

    // Build service layer
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        Arc::clone(&control_plane),
        Arc::clone(&store),
        Arc::clone(&snapshots),
        Arc::clone(&locks),
        config.retry_policy(),
        config.operation_timeout(),
    ));
    let monitor = Arc::new(EventMonitor::new(
        Arc::clone(&control_plane),
        Arc::clone(&store),
        Arc::clone(&snapshots),
        Arc::clone(&locks),
        checkpoints,
        MonitorSettings {
            retry: config.retry_policy(),
            call_timeout: config.operation_timeout(),
            reorder_window: config.event_reorder_window,
        },
    ));

    // Background tasks
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        tokio::spawn(Arc::clone(&monitor).run(shutdown_rx.clone())),
        spawn_tombstone_purger(
            Arc::clone(&store),
            Arc::clone(&locks),
            config.tombstone_grace(),
            shutdown_rx.clone(),
        ),
    ];
    if let Some(period) = config.reconcile_interval() {
        tasks.push(spawn_reconciler(Arc::clone(&monitor), period, shutdown_rx));
    }

    // Build application state
    let app_state = AppState {
        orchestrator,
        monitor,
        event_bus,
    };

    // Build router
    let app = Router::new()
        .merge(api::build_router())
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown requested");
        })
        .await?;

    // Stop background tasks, then the session
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "background task aborted");
        }
    }
    if let Err(err) = control_plane.disconnect().await {
        tracing::warn!(error = %err, "control plane disconnect failed");
    }
    tracing::info!("vm-orchestrator stopped");

    Ok(())
}
