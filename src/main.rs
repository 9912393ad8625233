use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbmcp::{
    config::{ServerConfig, TransportMode},
    db::SqlxDatabase,
    handlers, stdio, AppState,
};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout may carry the stdio protocol stream.
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("dbmcp={log_level},tower_http=warn").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "fatal startup or runtime error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("configuration error")?;
    let transport = config.transport;
    tracing::info!(
        transport = ?transport,
        auth_mode = config.auth_mode.as_str(),
        session_mode = config.session_mode.as_str(),
        "starting dbmcp"
    );

    let state = AppState::new(config, Arc::new(SqlxDatabase));

    let shutdown = CancellationToken::new();
    let _rate_sweeper = state.rate_limiter.spawn_sweeper(shutdown.clone());
    let _token_sweeper = state.tokens.spawn_sweeper(shutdown.clone());
    let _session_sweeper = state.sessions.spawn_sweeper(shutdown.clone());

    match transport {
        TransportMode::Stdio => {
            tokio::select! {
                result = stdio::run(state.clone(), shutdown.clone()) => result?,
                _ = shutdown_signal() => {
                    tracing::info!("shutdown signal received");
                }
            }
        }
        TransportMode::Http => {
            serve_http(state.clone(), shutdown.clone()).await?;
        }
        TransportMode::Both => {
            let stdio_task = tokio::spawn(stdio::run(state.clone(), shutdown.clone()));
            serve_http(state.clone(), shutdown.clone()).await?;
            shutdown.cancel();
            let _ = stdio_task.await;
        }
    }

    // Teardown order matters: sessions first, then tokens (whose cleanup
    // callbacks close the per-token pools), then whatever is left in the
    // registry, including the global pool.
    shutdown.cancel();
    state.sessions.shutdown().await;
    state.tokens.shutdown().await;
    state.pools.close_all().await;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn serve_http(state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let config = state.config.clone();
    let app = handlers::router(state);

    let addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.http_host, config.http_port))?;

    if !config.tls.enabled && !is_loopback(&config.http_host) {
        tracing::warn!(
            host = %config.http_host,
            "serving plaintext HTTP on a non-loopback interface"
        );
    }

    let handle = axum_server::Handle::new();
    {
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, draining connections");
            shutdown.cancel();
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });
    }

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    if config.tls.enabled {
        let cert = config.tls.cert_path.as_ref().context("TLS cert path missing")?;
        let key = config.tls.key_path.as_ref().context("TLS key path missing")?;
        let tls = RustlsConfig::from_pem_file(cert, key)
            .await
            .context("failed to load TLS certificate or key")?;

        tracing::info!(%addr, "listening with TLS");
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(make_service)
            .await?;
    } else {
        tracing::info!(%addr, "listening");
        axum_server::bind(addr)
            .handle(handle)
            .serve(make_service)
            .await?;
    }

    Ok(())
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
