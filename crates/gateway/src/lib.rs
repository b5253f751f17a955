//! WebSocket gateway that multiplexes exchange market and account streams
//! across browser clients.

pub mod adapters;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod routes;
pub mod session;
pub mod upstream;

pub use config::{GatewayConfig, GatewaySettings};
pub use error::GatewayError;
pub use gateway::{Gateway, GatewayStats};

use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the Axum application router.
pub fn build_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .merge(routes::gateway_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Build a gateway from a loaded config file.
pub fn gateway_from_config(config: &GatewayConfig) -> Result<Arc<Gateway>, GatewayError> {
    let gateway = Gateway::new(
        config.gateway.clone(),
        config.endpoint_table()?,
        Arc::new(config.token_validator()),
        Arc::new(config.credential_store()),
    )?;
    Ok(Arc::new(gateway))
}

/// Serve until ctrl-c or SIGTERM, then shut the gateway down.
pub async fn start_server(gateway: Arc<Gateway>, bind_addr: &str) -> anyhow::Result<()> {
    let app = build_router(gateway.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Gateway listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gateway))
        .await?;
    Ok(())
}

async fn shutdown_signal(gateway: Arc<Gateway>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
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
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
    gateway.shutdown().await;
}
