use scribe_gate::{
    api::create_router,
    clock::{Clock, SystemClock},
    components::{open_store, Collaborators, Components},
    config::Config,
    observability::init_tracing,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::load()?;
    config.validate()?;

    // Initialize tracing/logging
    init_tracing(&config.observability);

    tracing::info!("Starting Scribe Gate");
    tracing::info!(host = %config.server.host, port = config.server.port, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = open_store(&config.store, clock.clone()).await?;
    let collaborators = Collaborators::from_config(&config);
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let (components, event_task) = Components::build(config, clock, backend, collaborators);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper_task = components.sweeper().spawn(shutdown_rx.clone());
    let alert_task = spawn_alert_resolver(&components, shutdown_rx);

    let app = create_router(&components);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper_task.await {
        tracing::warn!(error = %e, "TTL sweeper task ended abnormally");
    }
    let _ = alert_task.await;
    components.sweeper().run_once().await;

    // Persist whatever security events are still queued
    if let Err(e) = components.monitor.event_log().flush().await {
        tracing::error!(error = %e, "Final security event flush failed");
    }
    drop(components);
    let _ = tokio::time::timeout(Duration::from_secs(5), event_task).await;

    Ok(())
}

/// Periodically resolve alerts that have gone quiet
fn spawn_alert_resolver(components: &Components, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let monitor = components.monitor.clone();
    let period = Duration::from_secs(components.config.monitor.alert_idle_resolve_seconds.max(60) as u64);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => match monitor.resolve_idle_alerts().await {
                    Ok(0) => {}
                    Ok(resolved) => tracing::info!(resolved = resolved, "Resolved idle security alerts"),
                    Err(e) => tracing::warn!(error = %e, "Idle alert resolution failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
