mod routes;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use etftp_transfer::{ClientConfig, DropPolicy, SessionConfig, TracingLogger};

use crate::routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    "etftp_gateway=debug,etftp_transfer=info,tower_http=debug".into()
                }),
        )
        .init();

    // Config
    let host = std::env::var("ETFTP_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("ETFTP_GATEWAY_PORT")
        .unwrap_or_else(|_| "8080".into())
        .parse()?;
    let server_addr: SocketAddr = std::env::var("ETFTP_SERVER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:7500".into())
        .parse()?;
    let block_size: u16 = std::env::var("ETFTP_BLOCK_SIZE")
        .unwrap_or_else(|_| "512".into())
        .parse()?;
    let window_size: u16 = std::env::var("ETFTP_WINDOW_SIZE")
        .unwrap_or_else(|_| "4".into())
        .parse()?;
    let initial_delay_ms: u64 = std::env::var("ETFTP_INITIAL_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(500);

    let client = ClientConfig {
        session: SessionConfig {
            block_size,
            window_size,
            initial_delay: Duration::from_millis(initial_delay_ms),
            ..Default::default()
        },
        timeout_option: None,
        drop_policy: DropPolicy::Never,
        logger: Arc::new(TracingLogger),
    };

    let state = AppState {
        server_addr,
        client: Arc::new(client),
    };

    let app = Router::new()
        .route("/getImage", get(routes::get_image))
        .route("/health", get(routes::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("etftp gateway listening on {}", addr);
    info!("Forwarding transfers to {}", server_addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
