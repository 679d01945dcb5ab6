mod status;

use std::time::Duration;

use anyhow::{Context, Result};
use arrow_flight::flight_service_server::FlightServiceServer;
use sqltunnel_core::{ProtocolService, ServerConfig, TunnelFlightService};
use tonic::transport::Server;

use tracing::{error, info};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = ServerConfig::load().context("failed to load configuration")?;
    init_tracing(&config);
    info!(
        host = %config.host,
        port = config.port,
        max_sessions = ?config.max_sessions,
        session_timeout_seconds = ?config.session_timeout_seconds,
        pool_max_size = config.pool_max_size,
        "service config loaded"
    );
    let addr = config
        .bind_addr()
        .context("failed to resolve bind address")?;

    let service = ProtocolService::new(&config);
    status::spawn_status_server(&config, service.clone())
        .context("failed to start status server")?;

    let reaper = service.clone();
    let period = reap_interval(reaper.sessions().session_timeout());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            reaper.reap_idle_sessions();
        }
    });

    let flight_service = TunnelFlightService::new(service);

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<FlightServiceServer<TunnelFlightService>>()
        .await;

    info!(%addr, "starting sqltunnel Flight server");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(%err, "failed to listen for CTRL+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(err) => {
                    error!(%err, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("received SIGINT, initiating graceful shutdown");
            }
            _ = terminate => {
                info!("received SIGTERM, initiating graceful shutdown");
            }
        }

        health_reporter
            .set_not_serving::<FlightServiceServer<TunnelFlightService>>()
            .await;

        let _ = shutdown_tx.send(());
    });

    Server::builder()
        .add_service(health_service)
        .add_service(FlightServiceServer::new(flight_service))
        .serve_with_shutdown(addr, async {
            shutdown_rx.await.ok();
        })
        .await
        .context("Flight server terminated unexpectedly")?;

    info!("server shutdown complete");
    Ok(())
}

/// Reaper period: a quarter of the idle timeout, between 1s and 5 minutes.
fn reap_interval(session_timeout: Duration) -> Duration {
    (session_timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(300))
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqltunnel_core::service=debug"));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .init();
    }
}
