//! BitMEX Stream Proxy Binary
//!
//! Starts the market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin bitmex-stream-proxy
//! ```
//!
//! # Environment Variables
//!
//! - `BITMEX_ENV`: production | testnet (default: production)
//! - `BITMEX_WS_URL`: Upstream URL override
//! - `BITMEX_TABLE`: Data table (default: instrument)
//! - `STREAM_PROXY_PORT`: Downstream WebSocket port (default: 8080)
//! - `STREAM_PROXY_HEALTH_PORT`: Health check and metrics port (default: 8082)
//! - `STREAM_PROXY_HEARTBEAT_INTERVAL_SECS`: Upstream ping interval (default: 20)
//! - `STREAM_PROXY_HEARTBEAT_TIMEOUT_SECS`: Upstream pong timeout (default: 20)
//! - `STREAM_PROXY_ACK_TIMEOUT_SECS`: Acknowledgement timeout, 0 disables (default: 30)
//! - `STREAM_PROXY_CLIENT_BUFFER`: Per-client outbound queue (default: 1024)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: bitmex-stream-proxy)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use bitmex_stream_proxy::infrastructure::telemetry;
use bitmex_stream_proxy::{
    ControlPort, FanoutRelay, HealthServer, HealthServerState, ProxyConfig, SessionRegistry,
    StreamProxy, UpstreamConfig, UpstreamManager, WebSocketServer, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting BitMEX Stream Proxy");

    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let registry = Arc::new(SessionRegistry::new());
    let relay = Arc::new(FanoutRelay::new(Arc::clone(&registry)));

    let upstream = Arc::new(UpstreamManager::new(
        UpstreamConfig::from(&config.upstream),
        Arc::clone(&relay),
        shutdown_token.clone(),
    ));
    let proxy = Arc::new(StreamProxy::new(
        Arc::clone(&relay),
        Arc::clone(&upstream) as Arc<dyn ControlPort>,
    ));

    // Without an upstream the relay keeps serving; subscriptions fail as upstream lost.
    let read_loop = match upstream.connect().await {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::error!(error = %e, "Initial upstream connection failed");
            None
        }
    };

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        upstream.feed_state(),
        Arc::clone(&relay),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let ws_server = WebSocketServer::new(
        config.server.port,
        Arc::clone(&proxy),
        config.server.client_buffer,
        shutdown_token.clone(),
    );
    let ws_task = tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            tracing::error!(error = %e, "WebSocket server error");
        }
    });

    tracing::info!("Stream proxy ready");

    await_shutdown(shutdown_token).await;

    let drain = async {
        let _ = ws_task.await;
        let _ = health_task.await;
        if let Some(read_loop) = read_loop {
            let _ = read_loop.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Stream proxy stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        environment = config.environment.as_str(),
        table = %config.upstream.table,
        port = config.server.port,
        health_port = config.server.health_port,
        client_buffer = config.server.client_buffer,
        "Configuration loaded"
    );
    tracing::debug!(
        url = %config.upstream.url,
        heartbeat_interval_secs = config.upstream.heartbeat_interval.as_secs(),
        heartbeat_timeout_secs = config.upstream.heartbeat_timeout.as_secs(),
        ack_timeout_secs = config.upstream.ack_timeout.map(|t| t.as_secs()),
        "Upstream settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
