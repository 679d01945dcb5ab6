//! Session registry - manages all active client sessions.
//!
//! The registry:
//! - Promotes a checked-out connection into a session on first stateful need
//! - Resolves session shells sent by clients, rejecting foreign or stale ones
//! - Terminates sessions with a detached, best-effort cleanup
//! - Cleans up idle sessions
//! - Enforces max session limit

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::engine::DuckDbConnection;
use crate::error::ServerError;
use crate::protocol::SessionInfo;
use crate::router::RoutedPool;
use crate::session::id::SessionId;
use crate::session::Session;

/// Registry for managing all active sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<RwLock<RegistryInner>>,
    max_sessions: usize,
    session_timeout: Duration,
    session_permits: Arc<Semaphore>,
}

#[derive(Clone, Serialize)]
pub struct SessionManagerSnapshot {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub session_timeout_seconds: u64,
    pub oldest_idle_ms: u64,
    pub average_idle_ms: u64,
    pub open_transactions: usize,
    pub registered_resources: usize,
}

struct RegistryInner {
    sessions: HashMap<SessionId, SessionEntry>,
}

struct SessionEntry {
    session: Arc<Session>,
    _permit: OwnedSemaphorePermit,
}

impl SessionManager {
    #[instrument(skip(config))]
    pub fn new(config: &ServerConfig) -> Self {
        let max_sessions = config.max_sessions.unwrap_or(200).max(1);
        let session_timeout = Duration::from_secs(config.session_timeout_seconds.unwrap_or(1800));

        info!(
            max_sessions,
            session_timeout_seconds = session_timeout.as_secs(),
            "session manager initialized"
        );

        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
            })),
            max_sessions,
            session_timeout,
            session_permits: Arc::new(Semaphore::new(max_sessions)),
        }
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .sessions
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim a session slot before checking out a connection for it.
    pub fn reserve(&self) -> Result<OwnedSemaphorePermit, ServerError> {
        self.session_permits.clone().try_acquire_owned().map_err(|_| {
            warn!(
                current = self.len(),
                max = self.max_sessions,
                "max sessions limit reached"
            );
            ServerError::MaxSessionsReached
        })
    }

    /// Register a new session owning `connection` for its whole lifetime.
    pub fn create_session(
        &self,
        permit: OwnedSemaphorePermit,
        client_id: &str,
        pool: Arc<RoutedPool>,
        connection: DuckDbConnection,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(
            SessionId::new(),
            client_id.to_string(),
            pool,
            connection,
        ));
        self.adopt(permit, session.clone());
        session
    }

    /// Register a session that began as a one-shot call and now needs to
    /// outlive it.
    pub fn adopt(&self, permit: OwnedSemaphorePermit, session: Arc<Session>) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let session_id = session.id().clone();
        info!(
            session_id = %session_id,
            conn_hash = %session.conn_hash(),
            client_id = session.client_id(),
            total_sessions = inner.sessions.len() + 1,
            "session created"
        );
        inner.sessions.insert(
            session_id,
            SessionEntry {
                session,
                _permit: permit,
            },
        );
    }

    pub fn get_by_id(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .sessions
            .get(session_id)
            .map(|entry| entry.session.clone())
    }

    /// Resolve the session named by a client shell. The shell's connection
    /// hash must match the session's, so a handle cannot cross data sources.
    pub fn get(&self, info: &SessionInfo) -> Result<Arc<Session>, ServerError> {
        let session_id = SessionId::from_string(info.session_uuid.clone());
        let session = self
            .get_by_id(&session_id)
            .ok_or_else(|| ServerError::SessionNotFound(info.session_uuid.clone()))?;
        if !info.conn_hash.is_empty() && info.conn_hash != session.conn_hash().as_ref() {
            debug!(session_id = %session_id, "session shell carries a foreign connection hash");
            return Err(ServerError::SessionNotFound(info.session_uuid.clone()));
        }
        session.ensure_open()?;
        Ok(session)
    }

    /// Remove a session and close it on the blocking pool without waiting.
    ///
    /// Removal is immediate, so later lookups fail at once. Cleanup errors
    /// are logged and never reach the caller.
    pub fn terminate(&self, session_id: &SessionId) -> bool {
        let removed = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .sessions
            .remove(session_id);
        match removed {
            Some(entry) => {
                close_detached(entry.session);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> SessionManagerSnapshot {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let total_sessions = inner.sessions.len();
        let mut total_idle_ms = 0u64;
        let mut oldest_idle_ms = 0u64;
        let mut open_transactions = 0usize;
        let mut registered_resources = 0usize;

        for entry in inner.sessions.values() {
            let idle_ms = entry.session.idle_duration().as_millis() as u64;
            total_idle_ms = total_idle_ms.saturating_add(idle_ms);
            oldest_idle_ms = oldest_idle_ms.max(idle_ms);
            if entry.session.transaction_id().is_some() {
                open_transactions += 1;
            }
            registered_resources += entry.session.resources().counts().total();
        }

        let average_idle_ms = if total_sessions == 0 {
            0
        } else {
            total_idle_ms / total_sessions as u64
        };

        SessionManagerSnapshot {
            total_sessions,
            max_sessions: self.max_sessions,
            session_timeout_seconds: self.session_timeout.as_secs(),
            oldest_idle_ms,
            average_idle_ms,
            open_transactions,
            registered_resources,
        }
    }

    /// Clean up idle sessions that have exceeded the timeout
    #[instrument(skip(self))]
    pub fn cleanup_idle_sessions(&self) -> usize {
        let expired = {
            let mut inner = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let stale: Vec<SessionId> = inner
                .sessions
                .iter()
                .filter(|(_, entry)| entry.session.idle_duration() > self.session_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| inner.sessions.remove(&id))
                .collect::<Vec<_>>()
        };

        let removed = expired.len();
        for entry in expired {
            info!(
                session_id = %entry.session.id(),
                idle_duration = ?entry.session.idle_duration(),
                "removing idle session"
            );
            close_detached(entry.session);
        }
        if removed > 0 {
            info!(removed, total_sessions = self.len(), "cleaned up idle sessions");
        }
        removed
    }
}

fn close_detached(session: Arc<Session>) {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = session.close() {
            warn!(session_id = %session.id(), error = %err, "session cleanup failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use anyhow::{anyhow, Result};

    use super::*;
    use crate::router::{ConnectionRouter, RouteRequest};

    fn build(max_sessions: usize, timeout_secs: u64) -> (SessionManager, ConnectionRouter) {
        let config = ServerConfig {
            max_sessions: Some(max_sessions),
            session_timeout_seconds: Some(timeout_secs),
            pool_min_idle: 0,
            ..ServerConfig::default()
        };
        (SessionManager::new(&config), ConnectionRouter::new(&config))
    }

    async fn open(
        manager: &SessionManager,
        router: &ConnectionRouter,
        password: &str,
    ) -> Result<Arc<Session>> {
        let props = HashMap::new();
        let pool = router
            .route_for(&RouteRequest {
                url: "duckdb::memory:",
                user: "u",
                password,
                datasource_name: "",
                properties: &props,
            })
            .map_err(|e| anyhow!(e.to_string()))?;
        let permit = manager.reserve().map_err(|e| anyhow!(e.to_string()))?;
        let connection = pool.acquire().await.map_err(|e| anyhow!(e.to_string()))?;
        Ok(manager.create_session(permit, "client", pool, connection))
    }

    #[test]
    fn snapshot_for_empty_registry_reports_zero_idle_times() {
        let (manager, _) = build(3, 60);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.total_sessions, 0);
        assert_eq!(snapshot.max_sessions, 3);
        assert_eq!(snapshot.session_timeout_seconds, 60);
        assert_eq!(snapshot.oldest_idle_ms, 0);
        assert_eq!(snapshot.average_idle_ms, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lookups_require_the_issuing_connection_hash() -> Result<()> {
        let (manager, router) = build(4, 60);
        let first = open(&manager, &router, "p").await?;
        let second = open(&manager, &router, "q").await?;

        assert!(manager.get(&first.info()).is_ok());
        let forged = SessionInfo {
            conn_hash: second.conn_hash().to_string(),
            ..first.info()
        };
        assert!(matches!(
            manager.get(&forged),
            Err(ServerError::SessionNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reserve_fails_when_limit_is_reached() -> Result<()> {
        let (manager, router) = build(1, 60);
        let _first = open(&manager, &router, "p").await?;
        let err = manager
            .reserve()
            .err()
            .ok_or_else(|| anyhow!("expected max-sessions error for second session"))?;
        assert!(matches!(err, ServerError::MaxSessionsReached));
        assert_eq!(manager.snapshot().total_sessions, 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminate_removes_immediately_and_frees_the_slot() -> Result<()> {
        let (manager, router) = build(1, 60);
        let session = open(&manager, &router, "p").await?;
        let info = session.info();

        assert!(manager.terminate(session.id()));
        assert!(!manager.terminate(session.id()));
        assert!(matches!(
            manager.get(&info),
            Err(ServerError::SessionNotFound(_))
        ));
        assert!(manager.reserve().is_ok());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_idle_sessions_removes_only_stale_sessions() -> Result<()> {
        let (manager, router) = build(4, 5);
        let stale = open(&manager, &router, "p").await?;
        let fresh = open(&manager, &router, "p").await?;

        *stale
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now() - Duration::from_secs(20);

        let removed = manager.cleanup_idle_sessions();
        assert_eq!(removed, 1);
        assert!(manager.get_by_id(stale.id()).is_none());
        assert!(manager.get_by_id(fresh.id()).is_some());
        Ok(())
    }
}
