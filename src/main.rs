use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use realtime_broker::config::Settings;
use realtime_broker::server::{create_app, AppState};
use realtime_broker::shutdown::GracefulShutdown;
use realtime_broker::tasks::{DemoTicker, HeartbeatTask};
use realtime_broker::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_telemetry(&settings.logging)?;

    tracing::info!(
        apps = settings.apps.len(),
        port = settings.server.port,
        "Configuration loaded"
    );

    // Create application state
    let state = AppState::new(settings.clone());
    tracing::info!("Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start heartbeat task in background
    let heartbeat_task = HeartbeatTask::new(
        settings.websocket.clone(),
        state.registry.clone(),
        state.rate_limiter.clone(),
        shutdown_tx.subscribe(),
    );
    let heartbeat_handle = tokio::spawn(async move {
        heartbeat_task.run().await;
    });

    // Optional demo traffic on the relay channel
    let demo_handle = match (settings.relay.demo_interval_secs, settings.relay_app_id()) {
        (Some(secs), Some(app_id)) if settings.relay.enabled && secs > 0 => {
            let ticker = DemoTicker::new(
                state.publisher.clone(),
                app_id,
                settings.relay.channel.clone(),
                settings.relay.event.clone(),
                Duration::from_secs(secs),
                shutdown_tx.subscribe(),
            );
            Some(tokio::spawn(ticker.run()))
        }
        _ => None,
    };

    let graceful = GracefulShutdown::new(state.registry.clone(), shutdown_tx.clone());

    // Create Axum app
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            graceful.execute("server shutdown").await;
        })
        .await?;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = heartbeat_handle.await;
    if let Some(handle) = demo_handle {
        let _ = handle.await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
