//! Price Stream Relay Binary
//!
//! Starts the relay over the simulated value source and serves it over HTTP.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin price-stream-relay
//! curl -N http://localhost:8083/stream/binance/btcusd
//! ```
//!
//! # Environment Variables
//!
//! - `RELAY_HTTP_PORT`: HTTP port (default: 8083)
//! - `RELAY_OPEN_TIMEOUT_SECS`: Session open timeout (default: 30)
//! - `RELAY_SETTLE_DELAY_MS`: Delay before the first poll (default: 3000)
//! - `RELAY_POLL_INTERVAL_MS`: Poll period (default: 500)
//! - `RELAY_READ_TIMEOUT_MS`: Per-read timeout (default: 2000)
//! - `RELAY_CLOSE_TIMEOUT_SECS`: Session close timeout (default: 10)
//! - `RELAY_LISTENER_BUFFER`: Per-stream queue depth (default: 256)
//! - `RELAY_SIM_SYMBOLS`: Comma-separated `SCOPE:SYMBOL` list served by the simulator
//! - `RELAY_SIM_FLAKINESS`: Probability a simulated read fails (default: 0.05)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: price-stream-relay)
//! - `RUST_LOG`: Log filter (default: `price_stream_relay=info`)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use price_stream_relay::infrastructure::http::{HttpServer, HttpState};
use price_stream_relay::infrastructure::telemetry;
use price_stream_relay::{RelayConfig, SimulatedSource, StreamEngine, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Upper bound on engine shutdown once a signal arrives.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_from_ancestors();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Price Stream Relay");

    init_metrics().context("failed to install Prometheus recorder")?;

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let source = Arc::new(SimulatedSource::new(&config.simulation));
    let engine = Arc::new(StreamEngine::new(source, config.engine));

    let http_state = Arc::new(HttpState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&engine),
        config.server.listener_buffer,
    ));
    let http_server = HttpServer::new(
        config.server.http_port,
        http_state,
        shutdown_token.clone(),
    );

    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!("Price stream relay ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, engine.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Engine shutdown timed out"
        );
    }

    if let Err(e) = http_task.await {
        tracing::warn!(error = %e, "HTTP server task ended abnormally");
    }

    tracing::info!("Price stream relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    let symbols: Vec<String> = config
        .simulation
        .symbols
        .iter()
        .map(ToString::to_string)
        .collect();

    tracing::info!(
        http_port = config.server.http_port,
        poll_interval_ms = config.engine.poll_interval.as_millis(),
        settle_delay_ms = config.engine.settle_delay.as_millis(),
        open_timeout_secs = config.engine.open_timeout.as_secs(),
        "Configuration loaded"
    );
    tracing::debug!(
        symbols = ?symbols,
        flakiness = config.simulation.flakiness,
        listener_buffer = config.server.listener_buffer,
        "Simulated source"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
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

/// Wait for SIGINT or SIGTERM, then cancel `shutdown_token`.
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!("Graceful shutdown started");
}
