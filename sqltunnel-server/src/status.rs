use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use sqltunnel_core::service::ServiceSnapshot;
use sqltunnel_core::{ProtocolService, ServerConfig};

const STATUS_PATH: &str = "/status.json";

#[derive(Serialize)]
struct StatusPayload {
    generated_at_ms: u64,
    #[serde(flatten)]
    service: ServiceSnapshot,
}

/// Serve the JSON status document when enabled in the config.
pub fn spawn_status_server(config: &ServerConfig, service: ProtocolService) -> Result<()> {
    if !config.status_enabled {
        return Ok(());
    }

    let addr: SocketAddr = format!("{}:{}", config.status_host, config.status_port)
        .parse()
        .with_context(|| "invalid status server bind address")?;

    let app = Router::new()
        .route("/", get(status_json))
        .route(STATUS_PATH, get(status_json))
        .with_state(service);

    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!(%err, "status server failed");
                }
            }
            Err(err) => {
                tracing::error!(%err, "status server bind failed");
            }
        }
    });

    tracing::info!(%addr, path = STATUS_PATH, "status server listening");
    Ok(())
}

async fn status_json(State(service): State<ProtocolService>) -> Json<StatusPayload> {
    Json(StatusPayload {
        generated_at_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
        service: service.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use axum::extract::State;

    use super::*;

    fn service(max_sessions: usize, timeout_secs: u64) -> ProtocolService {
        ProtocolService::new(&ServerConfig {
            max_sessions: Some(max_sessions),
            session_timeout_seconds: Some(timeout_secs),
            pool_min_idle: 0,
            ..ServerConfig::default()
        })
    }

    #[tokio::test]
    async fn status_json_reports_monitor_and_session_snapshots() -> Result<()> {
        let Json(payload) = status_json(State(service(7, 600))).await;
        assert!(payload.generated_at_ms > 0);
        assert_eq!(payload.service.sessions.max_sessions, 7);
        assert_eq!(payload.service.sessions.session_timeout_seconds, 600);
        assert!(payload.service.pools.is_empty());

        let json = serde_json::to_value(&payload)?;
        assert!(json.get("monitor").is_some());
        assert!(json.get("open_circuits").is_some());
        Ok(())
    }

    #[test]
    fn spawn_status_server_is_noop_when_disabled() -> Result<()> {
        let config = ServerConfig {
            status_enabled: false,
            status_host: "not-a-valid-host:".to_string(),
            ..ServerConfig::default()
        };
        spawn_status_server(&config, service(2, 60))?;
        Ok(())
    }

    #[test]
    fn spawn_status_server_validates_bind_address_when_enabled() -> Result<()> {
        let config = ServerConfig {
            status_enabled: true,
            status_host: "invalid host".to_string(),
            status_port: 9999,
            ..ServerConfig::default()
        };
        let err = spawn_status_server(&config, service(2, 60))
            .err()
            .ok_or_else(|| anyhow!("expected invalid bind address error"))?;
        assert!(err
            .to_string()
            .contains("invalid status server bind address"));
        Ok(())
    }
}
