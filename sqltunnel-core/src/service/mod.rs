//! Protocol orchestration.
//!
//! `ProtocolService` owns the router, the session registry, the circuit
//! breaker, the LOB processor and the performance monitor, and implements
//! one entry point per RPC. Requests that carry no session run on a
//! connection checked out for that call alone; the checkout is released when
//! the call ends unless the work needs the session to outlive it.

mod flight;
mod lob;
mod resource;
mod rows;
mod statement;
mod transaction;

pub use flight::TunnelFlightService;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, CircuitSnapshot};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::fingerprint::{ConnHash, OperationFingerprint};
use crate::lob::LobStreamProcessor;
use crate::metrics::{MonitorSnapshot, OperationKind, Outcome, PerformanceMonitor};
use crate::protocol::SessionInfo;
use crate::router::{ConnectionRouter, RoutedPoolSnapshot};
use crate::session::{Session, SessionId, SessionManager, SessionManagerSnapshot};
use crate::value::ParameterValue;

/// Row-block sizing shared by query and fetch calls.
#[derive(Debug, Clone, Copy)]
struct RowLimits {
    default_block: usize,
    max_block: usize,
    lob_inline_threshold: usize,
}

impl RowLimits {
    /// Rows for the next block: the explicit request, else the result set's
    /// fetch size, else the server default. Never above the maximum.
    fn block_size(&self, requested: i32, fetch_size: i32) -> usize {
        let pick = [requested, fetch_size]
            .into_iter()
            .find(|size| *size > 0)
            .map(|size| size as usize)
            .unwrap_or(self.default_block);
        pick.clamp(1, self.max_block)
    }
}

#[derive(Clone)]
pub struct ProtocolService {
    router: Arc<ConnectionRouter>,
    sessions: SessionManager,
    breaker: Arc<CircuitBreaker>,
    lobs: LobStreamProcessor,
    monitor: PerformanceMonitor,
    limits: RowLimits,
}

/// Everything the status endpoint reports.
#[derive(Clone, Serialize)]
pub struct ServiceSnapshot {
    pub monitor: MonitorSnapshot,
    pub sessions: SessionManagerSnapshot,
    pub pools: Vec<RoutedPoolSnapshot>,
    pub open_circuits: Vec<CircuitSnapshot>,
}

impl ProtocolService {
    pub fn new(config: &ServerConfig) -> Self {
        info!(
            row_block_size = config.row_block_size,
            lob_block_size = config.lob_block_size,
            breaker_failure_threshold = config.breaker_failure_threshold,
            "protocol service initialized"
        );
        Self {
            router: Arc::new(ConnectionRouter::new(config)),
            sessions: SessionManager::new(config),
            breaker: Arc::new(CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_open_duration(),
            )),
            lobs: LobStreamProcessor::new(config.lob_block_size),
            monitor: PerformanceMonitor::new(
                config.slow_query_threshold_ms,
                config.metrics_history_size,
            ),
            limits: RowLimits {
                default_block: config.row_block_size.max(1),
                max_block: config.max_row_block_size.max(config.row_block_size).max(1),
                lob_inline_threshold: config.lob_inline_threshold,
            },
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            monitor: self.monitor.snapshot(),
            sessions: self.sessions.snapshot(),
            pools: self.router.snapshot(),
            open_circuits: self.breaker.snapshot(),
        }
    }

    /// Terminate sessions idle beyond the configured timeout.
    pub fn reap_idle_sessions(&self) -> usize {
        self.sessions.cleanup_idle_sessions()
    }

    /// Resolve the session a shell names, or check out a connection for this
    /// call alone when it names none.
    async fn lease(&self, shell: &SessionInfo) -> Result<Lease, ServerError> {
        if shell.has_session() {
            return Ok(Lease::registered(self.sessions.get(shell)?));
        }
        let pool = self
            .router
            .require_pool(&ConnHash::from_string(shell.conn_hash.clone()))?;
        let connection = pool.acquire().await?;
        let session = Session::new(
            SessionId::new(),
            shell.client_uuid.clone(),
            pool,
            connection,
        );
        debug!(session_id = %session.id(), "checked out one-shot connection");
        Ok(Lease::one_shot(Arc::new(session)))
    }

    /// A registered session for work that outlives the call. A shell without
    /// a session gets one; the slot is claimed before a connection is taken.
    /// A session created here is terminated again unless the call keeps it.
    async fn stateful_session(&self, shell: &SessionInfo) -> Result<Claim, ServerError> {
        if shell.has_session() {
            return Ok(Claim {
                session: self.sessions.get(shell)?,
                sessions: self.sessions.clone(),
                created: false,
            });
        }
        let pool = self
            .router
            .require_pool(&ConnHash::from_string(shell.conn_hash.clone()))?;
        let permit = self.sessions.reserve()?;
        let connection = pool.acquire().await?;
        let session = self
            .sessions
            .create_session(permit, &shell.client_uuid, pool, connection);
        Ok(Claim {
            session,
            sessions: self.sessions.clone(),
            created: true,
        })
    }

    /// Drop a session whose connection the engine reported unusable.
    fn settle<T>(&self, session: &Session, result: Result<T, ServerError>) -> Result<T, ServerError> {
        if let Err(err) = &result {
            if err.is_connection_fatal() {
                warn!(session_id = %session.id(), error = %err, "connection lost; terminating session");
                self.monitor.record_error("connection", err.to_string());
                self.sessions.terminate(session.id());
            }
        }
        result
    }

    /// Pass the breaker for `fingerprint` and hold the call's outcome slot.
    fn guard(&self, fingerprint: OperationFingerprint) -> Result<BreakerGuard, ServerError> {
        self.breaker.pre_check(&fingerprint)?;
        Ok(BreakerGuard {
            breaker: self.breaker.clone(),
            fingerprint,
            settled: false,
        })
    }

    /// Record a finished statement with the monitor.
    fn observe<T>(
        &self,
        fingerprint: &OperationFingerprint,
        sql: &str,
        kind: OperationKind,
        started: Instant,
        result: &Result<T, ServerError>,
        rows: impl FnOnce(&T) -> Option<u64>,
    ) {
        let message;
        let outcome = match result {
            Ok(value) => Outcome::Success { rows: rows(value) },
            Err(err) => {
                message = err.to_string();
                Outcome::Failure { message: &message }
            }
        };
        self.monitor
            .record(fingerprint, sql, kind, started.elapsed(), outcome);
    }
}

/// Wait until every LOB referenced by `params` can be bound.
async fn wait_for_lobs(session: &Session, params: &[ParameterValue]) -> Result<(), ServerError> {
    for lob in session.lob_dependencies(params)? {
        lob.wait_bindable().await?;
    }
    Ok(())
}

/// Run blocking session work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ServerError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServerError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

/// A session used by one call. A one-shot lease is closed when dropped,
/// whatever the outcome, unless it was promoted into the registry.
struct Lease {
    session: Arc<Session>,
    registered: bool,
}

impl Lease {
    fn registered(session: Arc<Session>) -> Self {
        Self {
            session,
            registered: true,
        }
    }

    fn one_shot(session: Arc<Session>) -> Self {
        Self {
            session,
            registered: false,
        }
    }

    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The shell handed back: a one-shot call reports no session id.
    fn shell(&self) -> SessionInfo {
        if self.registered {
            return self.session.info();
        }
        SessionInfo {
            session_uuid: String::new(),
            conn_hash: self.session.conn_hash().to_string(),
            client_uuid: self.session.client_id().to_string(),
            transaction: None,
        }
    }

    /// Keep a one-shot session alive past this call.
    fn promote(&mut self, sessions: &SessionManager) -> Result<(), ServerError> {
        if self.registered {
            return Ok(());
        }
        let permit = sessions.reserve()?;
        sessions.adopt(permit, self.session.clone());
        self.registered = true;
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.registered {
            return;
        }
        let session = self.session.clone();
        let close = move || {
            if let Err(err) = session.close() {
                warn!(session_id = %session.id(), error = %err, "failed to release one-shot connection");
            }
        };
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

/// A registered session held by one call. A session the call created is
/// terminated when the claim drops, unless the call kept it.
struct Claim {
    session: Arc<Session>,
    sessions: SessionManager,
    created: bool,
}

impl Claim {
    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Leave the session registered after this call.
    fn keep(mut self) -> Arc<Session> {
        self.created = false;
        self.session.clone()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.created {
            debug!(session_id = %self.session.id(), "call failed; releasing the session it created");
            self.sessions.terminate(self.session.id());
        }
    }
}

/// Reports the engine outcome of one guarded call to the breaker. A guard
/// dropped without an outcome hands back any trial slot it held.
struct BreakerGuard {
    breaker: Arc<CircuitBreaker>,
    fingerprint: OperationFingerprint,
    settled: bool,
}

impl BreakerGuard {
    fn fingerprint(&self) -> &OperationFingerprint {
        &self.fingerprint
    }

    /// Record `result`; only engine errors count as failures.
    fn settle<T>(mut self, result: &Result<T, ServerError>) {
        match result {
            Ok(_) => self.breaker.on_success(&self.fingerprint),
            Err(err) if err.is_engine_error() => self.breaker.on_failure(&self.fingerprint, err),
            Err(_) => self.breaker.on_abandoned(&self.fingerprint),
        }
        self.settled = true;
    }
}

impl Drop for BreakerGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(&self.fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use anyhow::{anyhow, Result};

    use super::*;
    use crate::breaker::CircuitState;
    use crate::protocol::ConnectRequest;

    pub(super) fn test_service() -> ProtocolService {
        ProtocolService::new(&ServerConfig {
            pool_min_idle: 0,
            ..ServerConfig::default()
        })
    }

    pub(super) async fn connect(service: &ProtocolService) -> Result<SessionInfo> {
        service
            .connect(ConnectRequest {
                url: "duckdb::memory:".to_string(),
                user: "u".to_string(),
                password: "p".to_string(),
                client_uuid: "client-1".to_string(),
                properties: HashMap::new(),
                datasource_name: String::new(),
            })
            .await
            .map_err(|e| anyhow!(e.to_string()))
    }

    #[test]
    fn block_size_prefers_request_then_fetch_size() {
        let limits = RowLimits {
            default_block: 100,
            max_block: 500,
            lob_inline_threshold: 0,
        };
        assert_eq!(limits.block_size(7, 20), 7);
        assert_eq!(limits.block_size(0, 20), 20);
        assert_eq!(limits.block_size(0, 0), 100);
        assert_eq!(limits.block_size(10_000, 0), 500);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_shot_lease_is_not_registered() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        let lease = service.lease(&shell).await.map_err(|e| anyhow!(e.to_string()))?;
        assert!(lease.shell().session_uuid.is_empty());
        assert!(service.sessions().is_empty());
        let session = lease.session().clone();
        drop(lease);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !session.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn promoted_lease_survives_the_call() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        let mut lease = service.lease(&shell).await.map_err(|e| anyhow!(e.to_string()))?;
        lease
            .promote(service.sessions())
            .map_err(|e| anyhow!(e.to_string()))?;
        let promoted = lease.shell();
        drop(lease);
        assert!(!promoted.session_uuid.is_empty());
        let session = service
            .sessions()
            .get(&promoted)
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(!session.is_closed());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn created_claim_is_released_unless_kept() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;

        let dropped = service
            .stateful_session(&shell)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        let released = dropped.session().clone();
        assert_eq!(service.sessions().len(), 1);
        drop(dropped);
        assert!(service.sessions().is_empty());
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !released.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await?;

        let kept = service
            .stateful_session(&shell)
            .await
            .map_err(|e| anyhow!(e.to_string()))?
            .keep();
        let existing = service
            .stateful_session(&kept.info())
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        drop(existing);
        assert_eq!(service.sessions().len(), 1);
        assert!(!kept.is_closed());
        Ok(())
    }

    #[test]
    fn only_engine_errors_count_against_the_breaker() -> Result<()> {
        let service = ProtocolService::new(&ServerConfig {
            pool_min_idle: 0,
            breaker_failure_threshold: 1,
            ..ServerConfig::default()
        });
        let fingerprint = OperationFingerprint::of_sql("SELECT broken");

        let guard = service
            .guard(fingerprint.clone())
            .map_err(|e| anyhow!(e.to_string()))?;
        guard.settle::<()>(&Err(ServerError::MaxSessionsReached));
        assert_eq!(service.breaker().state(&fingerprint), CircuitState::Closed);

        let guard = service
            .guard(fingerprint.clone())
            .map_err(|e| anyhow!(e.to_string()))?;
        drop(guard);
        assert_eq!(service.breaker().state(&fingerprint), CircuitState::Closed);

        let conn = duckdb::Connection::open_in_memory()?;
        let engine_error = match conn.execute_batch("SELECT broken") {
            Ok(()) => return Err(anyhow!("expected the engine to reject the query")),
            Err(err) => ServerError::DuckDb(err),
        };
        let guard = service
            .guard(fingerprint.clone())
            .map_err(|e| anyhow!(e.to_string()))?;
        guard.settle::<()>(&Err(engine_error));
        assert_eq!(service.breaker().state(&fingerprint), CircuitState::Open);
        assert!(matches!(
            service.guard(fingerprint),
            Err(ServerError::CircuitOpen { .. })
        ));
        Ok(())
    }
}
