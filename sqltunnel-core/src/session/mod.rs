//! Session management module.
//!
//! This module provides:
//! - `Session`: one exclusively owned pooled connection plus its resource arena
//! - `SessionManager`: registry of live sessions with idle cleanup and limits
//! - `SessionId`, `ResourceId`, `TransactionId`: identifiers handed to clients

pub mod id;
pub mod registry;
pub mod resources;

pub use id::{ResourceId, SessionId, TransactionId};
pub use registry::{SessionManager, SessionManagerSnapshot};
pub use resources::{
    Attribute, BatchEntry, ColumnMeta, CursorMotion, PositionFlags, ResourceArena, ResourceCounts,
    ResultSetMetaDataSnapshot, ResultSetResource, StatementResource, StatementState,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use duckdb::types::Value;
use tracing::{debug, info, instrument, warn};

use crate::capability::Capabilities;
use crate::engine::{DuckDbConnection, QueryResult};
use crate::error::ServerError;
use crate::fingerprint::ConnHash;
use crate::lob::LobResource;
use crate::protocol::{SessionInfo, TransactionInfo, TransactionStatus};
use crate::router::RoutedPool;
use crate::sql::{StatementKind, TransactionControl};
use crate::value::ParameterValue;

/// Family of a registered resource, used in not-found errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Statement,
    PreparedStatement,
    CallableStatement,
    ResultSet,
    Lob,
    Attribute,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Statement => "statement",
            ResourceKind::PreparedStatement => "prepared statement",
            ResourceKind::CallableStatement => "callable statement",
            ResourceKind::ResultSet => "result set",
            ResourceKind::Lob => "lob",
            ResourceKind::Attribute => "attribute",
        };
        f.write_str(name)
    }
}

/// JDBC connection properties tracked per session.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    pub read_only: bool,
    pub transaction_isolation: i32,
    pub holdability: i32,
    pub network_timeout_ms: i32,
    pub client_info: HashMap<String, String>,
    pub next_savepoint: i32,
}

/// `Connection.TRANSACTION_SERIALIZABLE`; the only level DuckDB offers.
pub const TRANSACTION_SERIALIZABLE: i32 = 8;
/// `ResultSet.CLOSE_CURSORS_AT_COMMIT`.
pub const CLOSE_CURSORS_AT_COMMIT: i32 = 2;

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            read_only: false,
            transaction_isolation: TRANSACTION_SERIALIZABLE,
            holdability: CLOSE_CURSORS_AT_COMMIT,
            network_timeout_ms: 0,
            client_info: HashMap::new(),
            next_savepoint: 1,
        }
    }
}

/// A client session with a dedicated connection and its resources
pub struct Session {
    id: SessionId,
    conn_hash: ConnHash,
    client_id: String,
    pool: Arc<RoutedPool>,
    connection: DuckDbConnection,
    resources: ResourceArena,
    transaction: Mutex<Option<TransactionId>>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Session {
    #[instrument(skip(pool, connection), fields(conn_hash = %pool.conn_hash()))]
    pub fn new(
        id: SessionId,
        client_id: String,
        pool: Arc<RoutedPool>,
        connection: DuckDbConnection,
    ) -> Self {
        debug!(session_id = %id, "created new session");
        Self {
            id,
            conn_hash: pool.conn_hash().clone(),
            client_id,
            pool,
            connection,
            resources: ResourceArena::new(),
            transaction: Mutex::new(None),
            state: Mutex::new(ConnectionState::default()),
            closed: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn conn_hash(&self) -> &ConnHash {
        &self.conn_hash
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn pool(&self) -> &Arc<RoutedPool> {
        &self.pool
    }

    pub fn capabilities(&self) -> Capabilities {
        self.pool.capabilities()
    }

    pub fn resources(&self) -> &ResourceArena {
        &self.resources
    }

    pub fn connection_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get time since last activity
    pub fn idle_duration(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    /// Update last activity timestamp
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Instant::now();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ensure_open(&self) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::SessionClosed(self.id.to_string()));
        }
        Ok(())
    }

    fn transaction_slot(&self) -> MutexGuard<'_, Option<TransactionId>> {
        self.transaction
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        *self.transaction_slot()
    }

    pub fn transaction_info(&self) -> Option<TransactionInfo> {
        self.transaction_id().map(|id| TransactionInfo {
            transaction_uuid: id.to_string(),
            status: TransactionStatus::Active as i32,
        })
    }

    /// Session shell returned to the client.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_uuid: self.id.to_string(),
            conn_hash: self.conn_hash.to_string(),
            client_uuid: self.client_id.clone(),
            transaction: self.transaction_info(),
        }
    }

    /// Run work on the session connection. An aborted transaction is rolled
    /// back so the session stays usable; the failed work is not retried.
    pub fn run<T>(
        &self,
        op: impl FnOnce(&DuckDbConnection) -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        self.ensure_open()?;
        self.touch();
        let result = op(&self.connection);
        if let Err(err) = &result {
            if err.is_transaction_abort() {
                self.recover_from_transaction_abort(err);
            }
        }
        result
    }

    fn recover_from_transaction_abort(&self, err: &ServerError) {
        warn!(session_id = %self.id, error = %err, "transaction aborted; rolling back session state");
        match self.connection.execute_batch("ROLLBACK") {
            Ok(()) => {
                let cleared = self.transaction_slot().take();
                info!(
                    session_id = %self.id,
                    transaction_id = ?cleared,
                    "auto-rolled back aborted transaction"
                );
            }
            Err(rollback_err) => {
                warn!(session_id = %self.id, error = %rollback_err, "failed to rollback aborted transaction");
            }
        }
    }

    // === Execution ===

    /// LOBs referenced by `params`. Callers await their readiness before
    /// moving onto the blocking pool.
    pub fn lob_dependencies(
        &self,
        params: &[ParameterValue],
    ) -> Result<Vec<Arc<LobResource>>, ServerError> {
        params
            .iter()
            .filter_map(ParameterValue::lob_ref)
            .map(|id| self.resources.lob(id))
            .collect()
    }

    /// Engine values for `params`, resolving LOB handles in this session.
    pub fn bind(&self, params: &[ParameterValue]) -> Result<Vec<Value>, ServerError> {
        params
            .iter()
            .map(|param| match param.lob_ref() {
                Some(id) => self.resources.lob(id)?.engine_value(),
                None => param.to_engine(),
            })
            .collect()
    }

    pub fn execute_query(
        &self,
        sql: &str,
        params: &[ParameterValue],
    ) -> Result<QueryResult, ServerError> {
        let values = self.bind(params)?;
        self.run(|conn| conn.execute_query(sql, &values))
    }

    /// Run DDL or DML. Transaction control written as SQL goes through the
    /// session so its transaction handle stays in step with the engine.
    pub fn execute_update(&self, sql: &str, params: &[ParameterValue]) -> Result<i64, ServerError> {
        if let StatementKind::Transaction(control) = StatementKind::classify(sql) {
            if params.is_empty() {
                return self.apply_transaction_control(control, sql).map(|()| 0);
            }
        }
        let values = self.bind(params)?;
        let affected = self.run(|conn| conn.execute_update(sql, &values))?;
        Ok(i64::try_from(affected).unwrap_or(i64::MAX))
    }

    fn apply_transaction_control(
        &self,
        control: TransactionControl,
        sql: &str,
    ) -> Result<(), ServerError> {
        match (control, self.transaction_id()) {
            (TransactionControl::Begin, _) => self.begin_transaction().map(|_| ()),
            (TransactionControl::Commit, Some(_)) => self.commit_transaction().map(|_| ()),
            (TransactionControl::Rollback, Some(_)) => self.rollback_transaction().map(|_| ()),
            (_, None) => self.run(|conn| conn.execute_batch(sql)),
        }
    }

    // === Transactions ===

    /// Begin a transaction; an already active one is returned unchanged.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn begin_transaction(&self) -> Result<TransactionId, ServerError> {
        if let Some(active) = self.transaction_id() {
            return Ok(active);
        }
        self.run(|conn| conn.execute_batch("BEGIN TRANSACTION"))?;
        let tx_id = TransactionId::new();
        *self.transaction_slot() = Some(tx_id);
        debug!(transaction_id = %tx_id, "began transaction");
        Ok(tx_id)
    }

    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn commit_transaction(&self) -> Result<TransactionId, ServerError> {
        self.end_transaction("COMMIT", "committed")
    }

    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn rollback_transaction(&self) -> Result<TransactionId, ServerError> {
        self.end_transaction("ROLLBACK", "rolled back")
    }

    fn end_transaction(&self, sql: &str, op_name: &str) -> Result<TransactionId, ServerError> {
        let tx_id = self
            .transaction_id()
            .ok_or(ServerError::TransactionNotActive)?;
        self.run(|conn| conn.execute_batch(sql))?;
        self.transaction_slot().take();
        debug!(transaction_id = %tx_id, operation = op_name, "completed transaction");
        Ok(tx_id)
    }

    /// Auto-commit is on exactly when no transaction is open.
    pub fn auto_commit(&self) -> bool {
        self.transaction_id().is_none()
    }

    /// Enabling auto-commit commits an open transaction; disabling it opens one.
    pub fn set_auto_commit(&self, enabled: bool) -> Result<(), ServerError> {
        match (enabled, self.transaction_id()) {
            (true, Some(_)) => self.commit_transaction().map(|_| ()),
            (false, None) => self.begin_transaction().map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Release every resource and hand the connection back to its pool.
    /// Blocking: an open transaction is rolled back first.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn close(&self) -> Result<ResourceCounts, ServerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(ResourceCounts::default());
        }
        let counts = self.resources.clear("session terminated");
        let rollback = if self.transaction_slot().take().is_some() {
            self.connection.execute_batch("ROLLBACK")
        } else {
            Ok(())
        };
        self.connection.release();
        info!(
            released_resources = counts.total(),
            "session closed"
        );
        rollback.map(|()| counts)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use anyhow::{anyhow, Result};

    use super::*;
    use crate::config::ServerConfig;
    use crate::router::{ConnectionRouter, RouteRequest};

    pub(crate) async fn session() -> Result<Session> {
        let router = ConnectionRouter::new(&ServerConfig {
            pool_min_idle: 0,
            ..ServerConfig::default()
        });
        let props = HashMap::new();
        let pool = router
            .route_for(&RouteRequest {
                url: "duckdb::memory:",
                user: "u",
                password: "p",
                datasource_name: "",
                properties: &props,
            })
            .map_err(|e| anyhow!(e.to_string()))?;
        let connection = pool.acquire().await.map_err(|e| anyhow!(e.to_string()))?;
        Ok(Session::new(SessionId::new(), "client-1".to_string(), pool, connection))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transactions_commit_and_roll_back() -> Result<()> {
        let session = session().await?;
        session
            .run(|conn| conn.execute_batch("CREATE TABLE t(x INT)"))
            .map_err(|e| anyhow!(e.to_string()))?;

        let tx = session.begin_transaction().map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(session.begin_transaction().ok(), Some(tx));
        assert!(session.info().transaction.is_some());
        session
            .run(|conn| conn.execute_update("INSERT INTO t VALUES (1)", &[]))
            .map_err(|e| anyhow!(e.to_string()))?;
        session.rollback_transaction().map_err(|e| anyhow!(e.to_string()))?;

        let count = session
            .run(|conn| conn.execute_query("SELECT * FROM t", &[]))
            .map_err(|e| anyhow!(e.to_string()))?
            .total_rows;
        assert_eq!(count, 0);
        assert!(matches!(
            session.commit_transaction(),
            Err(ServerError::TransactionNotActive)
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn aborted_transaction_is_rolled_back_without_retry() -> Result<()> {
        let session = session().await?;
        session
            .run(|conn| conn.execute_batch("CREATE TABLE t(x INT PRIMARY KEY)"))
            .map_err(|e| anyhow!(e.to_string()))?;
        session.begin_transaction().map_err(|e| anyhow!(e.to_string()))?;
        session
            .run(|conn| conn.execute_update("INSERT INTO t VALUES (1)", &[]))
            .map_err(|e| anyhow!(e.to_string()))?;
        let _ = session.run(|conn| conn.execute_update("INSERT INTO t VALUES (1)", &[]));

        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let _ = session.run(|conn| {
            attempts.fetch_add(1, Ordering::SeqCst);
            conn.execute_update("INSERT INTO t VALUES (2)", &[])
        });
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(session.transaction_id().is_none());

        session
            .run(|conn| conn.execute_update("INSERT INTO t VALUES (3)", &[]))
            .map_err(|e| anyhow!(e.to_string()))?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sql_transaction_control_tracks_the_session_handle() -> Result<()> {
        let session = session().await?;
        session
            .execute_update("CREATE TABLE t(x INT)", &[])
            .map_err(|e| anyhow!(e.to_string()))?;
        session
            .execute_update("BEGIN TRANSACTION", &[])
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(!session.auto_commit());
        session
            .execute_update("INSERT INTO t VALUES (?)", &[ParameterValue::Int(1)])
            .map_err(|e| anyhow!(e.to_string()))?;
        session
            .execute_update("COMMIT", &[])
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(session.transaction_id().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lob_parameters_bind_from_the_session_arena() -> Result<()> {
        let session = session().await?;
        let lob = Arc::new(LobResource::empty(crate::protocol::LobType::Clob));
        lob.write_block(1, "héllo".as_bytes())
            .map_err(|e| anyhow!(e.to_string()))?;
        let id = session.resources().register_lob(lob);

        let result = session
            .execute_query("SELECT ?::VARCHAR AS v", &[ParameterValue::ClobRef(id)])
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(result.total_rows, 1);

        let foreign = ParameterValue::BlobRef(ResourceId::new());
        assert!(matches!(
            session.bind(&[foreign]),
            Err(ServerError::ResourceNotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_session_rejects_work_and_releases_resources() -> Result<()> {
        let session = session().await?;
        session
            .resources()
            .register_statement(StatementResource::plain());
        let counts = session.close().map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(counts.statements, 1);
        assert!(session.is_closed());
        assert!(matches!(
            session.run(|conn| conn.execute_batch("SELECT 1")),
            Err(ServerError::SessionClosed(_))
        ));
        assert_eq!(session.close().map_err(|e| anyhow!(e.to_string()))?.total(), 0);
        Ok(())
    }
}
