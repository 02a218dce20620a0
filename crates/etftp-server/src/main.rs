mod fetch;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use etftp_transfer::{CachedSource, DropPolicy, Server, ServerConfig, SessionConfig, TracingLogger};
use tracing::{info, warn};

use crate::fetch::HttpSource;

fn env_or<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.into())
        .parse()
        .with_context(|| format!("invalid {name}"))
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "etftp_server=debug,etftp_transfer=info".into()),
        )
        .init();

    // Config
    let host: String = env_or("ETFTP_HOST", "0.0.0.0")?;
    let port: u16 = env_or("ETFTP_PORT", "7500")?;
    let session = SessionConfig {
        block_size: env_or("ETFTP_BLOCK_SIZE", "512")?,
        window_size: env_or("ETFTP_WINDOW_SIZE", "4")?,
        initial_delay: Duration::from_millis(env_or("ETFTP_INITIAL_DELAY_MS", "500")?),
        max_delay: Duration::from_millis(env_or("ETFTP_MAX_DELAY_MS", "30000")?),
        max_timeouts: env_or("ETFTP_MAX_TIMEOUTS", "5")?,
        transfer_size: None,
    };
    let drop_rate: f64 = env_or("ETFTP_DROP_RATE", "0.0")?;
    let cache_size: usize = env_or("ETFTP_CACHE_SIZE", "10")?;
    let fetch_timeout = Duration::from_secs(env_or("ETFTP_FETCH_TIMEOUT_SECS", "10")?);

    anyhow::ensure!(
        (0.0..=1.0).contains(&drop_rate),
        "ETFTP_DROP_RATE must be between 0.0 and 1.0, got {drop_rate}"
    );
    let drop_policy = if drop_rate > 0.0 {
        warn!("Simulating {:.1}% DATA packet loss", drop_rate * 100.0);
        DropPolicy::Rate(drop_rate)
    } else {
        DropPolicy::Never
    };

    let source = CachedSource::new(HttpSource::new(fetch_timeout)?, cache_size);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let server = Server::bind(
        addr,
        source,
        ServerConfig {
            session: session.clone(),
            drop_policy,
            logger: Arc::new(TracingLogger),
        },
    )
    .with_context(|| format!("failed to bind {addr}"))?;

    info!("etftp server listening on {}", server.local_addr()?);
    info!(
        "Defaults: blksize={} windowsize={} timeout={}ms..{}ms retries={} cache={}",
        session.block_size,
        session.window_size,
        session.initial_delay.as_millis(),
        session.max_delay.as_millis(),
        session.max_timeouts,
        cache_size
    );

    let handle = server.shutdown_handle();
    let listener = std::thread::Builder::new()
        .name("etftp-listener".into())
        .spawn(move || server.serve())?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(shutdown_signal());

    handle.shutdown();
    listener
        .join()
        .map_err(|_| anyhow::anyhow!("listener thread panicked"))??;
    info!("etftp server stopped");
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
