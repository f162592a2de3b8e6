// nexus-protocol-rs/src/main.rs
// Nexus Protocol server entry point

use tracing::info;
use tracing_subscriber::EnvFilter;

use nexus_protocol_rs::{router, AppState, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;
    let addr = config.bind_address();

    let state = AppState::build(config).await;
    let webhooks = state.webhooks.clone();
    let app = router(state);

    info!(address = %addr, "Nexus Protocol server starting");
    println!("Nexus Protocol server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    // ConnectInfo feeds the per-peer rate-limit identity for
    // unauthenticated callers
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Pending webhook retries observe the shutdown and fail fast
        webhooks.shutdown();
        info!("Shutdown signal received");
    })
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
