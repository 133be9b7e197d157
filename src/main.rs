use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use worker_fleet::api::{self, AppState};
use worker_fleet::clock::{Clock, SystemClock};
use worker_fleet::config::FleetConfig;
use worker_fleet::fleet::Fleet;
use worker_fleet::scheduler;
use worker_fleet::store::{FleetStore, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = FleetConfig::from_env().context("Failed to load configuration")?;

    // Initialize tracing: stderr always, plus a daily file when configured.
    // The guard must outlive the runtime so buffered lines are flushed.
    let (file_layer, _log_guard) = match &config.server.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "worker-fleet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    eprintln!("Worker Fleet v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", config.server.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = &config.server.db_path;
    let store: Arc<dyn FleetStore> = Arc::new(
        LibSqlBackend::new_local(db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
    );
    eprintln!("   Database: {}", db_path.display());

    // ── Services ─────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let fleet = Arc::new(Fleet::from_config(store, clock, &config));

    if config.server.scheduler_token.is_none() {
        tracing::warn!("FLEET_SCHEDULER_TOKEN not set; trigger endpoints will reject all calls");
    }
    if config.server.admin_token.is_none() {
        tracing::warn!("FLEET_ADMIN_TOKEN not set; pool maintenance endpoints are disabled");
    }

    // ── Scheduler ────────────────────────────────────────────────────────
    let handles = if config.server.run_scheduler {
        let handles = scheduler::spawn_all(&fleet, &config).context("Failed to start scheduler")?;
        eprintln!(
            "   Scheduler: enabled (autoscale every {}s, alerts \"{}\")",
            config.autoscale.tick_interval.as_secs(),
            config.alerts.schedule,
        );
        handles
    } else {
        eprintln!("   Scheduler: disabled (external triggers only)");
        Vec::new()
    };

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(AppState::new(Arc::clone(&fleet), &config.server));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;
    tracing::info!(port = config.server.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    for handle in handles {
        handle.abort();
    }
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
