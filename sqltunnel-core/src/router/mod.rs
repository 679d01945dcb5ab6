//! Connection routing: one shared pool per connection fingerprint.
//!
//! Pools are created lazily on first use with settings taken from the server
//! defaults and the client's overrides. Building a pool only holds a gate for
//! its own fingerprint, so a slow database never stalls routes to others.
//! Every acquisition is bounded by a hard timeout layered over the pool's own
//! timeout, so a saturated pool always answers with a connection or a
//! `ConnectionTimeout` carrying its occupancy.

mod manager;

pub use manager::{DatabaseTarget, DuckDbManager};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use r2d2::{Pool, PooledConnection};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::capability::{Capabilities, DatabaseKind};
use crate::config::{PoolSettings, ServerConfig};
use crate::engine::DuckDbConnection;
use crate::error::ServerError;
use crate::fingerprint::ConnHash;

use manager::{reset_on_checkout, InitOnConnect};

/// Pool occupancy reported with acquisition timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active: u32,
    pub idle: u32,
    pub total: u32,
    pub waiting: u32,
    pub max: u32,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} idle={} total={} waiting={} max={}",
            self.active, self.idle, self.total, self.waiting, self.max
        )
    }
}

/// Connection parameters that select a pool.
#[derive(Debug, Clone)]
pub struct RouteRequest<'a> {
    pub url: &'a str,
    pub user: &'a str,
    pub password: &'a str,
    pub datasource_name: &'a str,
    pub properties: &'a HashMap<String, String>,
}

impl RouteRequest<'_> {
    pub fn conn_hash(&self) -> ConnHash {
        ConnHash::new(self.url, self.user, self.password, self.datasource_name)
    }
}

/// A pool bound to one connection fingerprint.
pub struct RoutedPool {
    conn_hash: ConnHash,
    kind: DatabaseKind,
    capabilities: Capabilities,
    settings: PoolSettings,
    hard_timeout: Duration,
    max_result_bytes: usize,
    pool: Pool<DuckDbManager>,
    waiting: Arc<AtomicUsize>,
}

/// How one blocking checkout ended.
enum Checkout {
    Ready(PooledConnection<DuckDbManager>),
    /// The caller stopped waiting; the connection went back to the pool.
    Abandoned,
    TimedOut,
}

/// Prefix r2d2 puts before the last connect error on a failed checkout.
const CHECKOUT_FAILURE_PREFIX: &str = "timed out waiting for connection: ";

/// Split a failed r2d2 checkout into a plain wait timeout (None) and a pool
/// that could not open connections, keeping the connect error it reported.
fn checkout_failure(err: &r2d2::Error) -> Option<ServerError> {
    err.to_string()
        .strip_prefix(CHECKOUT_FAILURE_PREFIX)
        .map(|cause| ServerError::ConnectionFailed(cause.to_string()))
}

#[derive(Clone, Serialize)]
pub struct RoutedPoolSnapshot {
    pub conn_hash: String,
    pub kind: String,
    pub stats: PoolStats,
}

/// Decrements the waiter count when the blocking acquisition finishes,
/// whether or not its caller is still listening.
struct WaitingGuard(Arc<AtomicUsize>);

impl WaitingGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RoutedPool {
    fn build(
        conn_hash: ConnHash,
        url: &str,
        settings: PoolSettings,
        limits: &RouteLimits,
        init_sql: Option<&str>,
    ) -> Result<Self, ServerError> {
        let kind = DatabaseKind::from_url(url);
        let manager = DuckDbManager::open(&DatabaseTarget::from_url(url))?;
        let pool = Pool::builder()
            .max_size(settings.max_size)
            .min_idle(Some(settings.min_idle))
            .idle_timeout(Some(settings.idle_timeout))
            .max_lifetime(Some(settings.max_lifetime))
            .connection_timeout(settings.connection_timeout)
            .connection_customizer(Box::new(InitOnConnect::new(init_sql)))
            .build(manager)
            .map_err(|err| ServerError::PoolBuild(err.to_string()))?;

        info!(
            conn_hash = %conn_hash,
            %kind,
            max_size = settings.max_size,
            min_idle = settings.min_idle,
            connection_timeout_ms = settings.connection_timeout.as_millis() as u64,
            "created routed pool"
        );

        Ok(Self {
            conn_hash,
            kind,
            capabilities: kind.capabilities(),
            settings,
            hard_timeout: limits.hard_timeout,
            max_result_bytes: limits.max_result_bytes,
            pool,
            waiting: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn conn_hash(&self) -> &ConnHash {
        &self.conn_hash
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            active: state.connections.saturating_sub(state.idle_connections),
            idle: state.idle_connections,
            total: state.connections,
            waiting: self.waiting.load(Ordering::SeqCst) as u32,
            max: self.settings.max_size,
        }
    }

    /// Check out a connection, giving up after the hard timeout.
    ///
    /// The blocking checkout runs on the blocking pool. If the hard timeout
    /// fires first the attempt is flagged as cancelled, and a connection that
    /// arrives afterwards goes straight back to the pool. A pool that cannot
    /// open connections fails with `ConnectionFailed` and the connect error.
    #[instrument(skip(self), fields(conn_hash = %self.conn_hash))]
    pub async fn acquire(&self) -> Result<DuckDbConnection, ServerError> {
        let started = Instant::now();
        let cancelled = Arc::new(AtomicBool::new(false));
        let waiting = WaitingGuard::enter(&self.waiting);
        let pool = self.pool.clone();
        let wait = self.settings.connection_timeout.min(self.hard_timeout);
        let flag = cancelled.clone();

        let attempt = tokio::task::spawn_blocking(move || {
            let _waiting = waiting;
            let conn = match pool.get_timeout(wait) {
                Ok(conn) => conn,
                Err(err) => return checkout_failure(&err).map_or(Ok(Checkout::TimedOut), Err),
            };
            if flag.load(Ordering::SeqCst) {
                return Ok(Checkout::Abandoned);
            }
            reset_on_checkout(&conn)?;
            Ok(Checkout::Ready(conn))
        });

        match tokio::time::timeout(self.hard_timeout, attempt).await {
            Ok(joined) => match joined? {
                Ok(Checkout::Ready(conn)) => {
                    debug!(
                        waited_ms = started.elapsed().as_millis() as u64,
                        "checked out pooled connection"
                    );
                    Ok(DuckDbConnection::new(conn, self.max_result_bytes))
                }
                Ok(Checkout::Abandoned | Checkout::TimedOut) => Err(self.timeout_error(started)),
                Err(err) => {
                    warn!(conn_hash = %self.conn_hash, error = %err, "connection checkout failed");
                    Err(err)
                }
            },
            Err(_) => {
                cancelled.store(true, Ordering::SeqCst);
                Err(self.timeout_error(started))
            }
        }
    }

    fn timeout_error(&self, started: Instant) -> ServerError {
        let stats = self.stats();
        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(conn_hash = %self.conn_hash, waited_ms, %stats, "connection acquisition timed out");
        ServerError::ConnectionTimeout { waited_ms, stats }
    }
}

/// Limits every routed pool applies to its connections.
#[derive(Debug, Clone, Copy)]
struct RouteLimits {
    hard_timeout: Duration,
    max_result_bytes: usize,
}

/// Maps connection fingerprints to their shared pools.
pub struct ConnectionRouter {
    /// Pools that finished building.
    pools: RwLock<HashMap<ConnHash, Arc<RoutedPool>>>,
    /// One gate per fingerprint whose pool is being built.
    building: Mutex<HashMap<ConnHash, Arc<Mutex<()>>>>,
    defaults: PoolSettings,
    limits: RouteLimits,
    init_sql: Option<String>,
}

impl ConnectionRouter {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            building: Mutex::new(HashMap::new()),
            defaults: config.pool_defaults(),
            limits: RouteLimits {
                hard_timeout: config.acquire_hard_timeout(),
                max_result_bytes: config.max_result_bytes,
            },
            init_sql: config.init_sql.clone(),
        }
    }

    /// Return the pool for these parameters, building it on first use.
    ///
    /// Building opens the database and fills `min_idle`, so call this from a
    /// blocking context. Concurrent first uses of one fingerprint build once;
    /// other fingerprints are never held up by the build.
    pub fn route_for(&self, request: &RouteRequest<'_>) -> Result<Arc<RoutedPool>, ServerError> {
        let conn_hash = request.conn_hash();
        if let Some(pool) = self.pool(&conn_hash) {
            return Ok(pool);
        }

        let settings = self.defaults.clone().with_overrides(request.properties)?;
        let gate = self.gate(&conn_hash);
        let _building = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pool) = self.pool(&conn_hash) {
            return Ok(pool);
        }
        let built = RoutedPool::build(
            conn_hash.clone(),
            request.url,
            settings,
            &self.limits,
            self.init_sql.as_deref(),
        );
        let routed = built.map(|pool| {
            self.pools
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .entry(conn_hash.clone())
                .or_insert_with(|| Arc::new(pool))
                .clone()
        });
        self.building
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&conn_hash);
        routed
    }

    fn gate(&self, conn_hash: &ConnHash) -> Arc<Mutex<()>> {
        self.building
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(conn_hash.clone())
            .or_default()
            .clone()
    }

    pub fn pool(&self, conn_hash: &ConnHash) -> Option<Arc<RoutedPool>> {
        self.pools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(conn_hash)
            .cloned()
    }

    /// Resolve a pool registered by an earlier `connect`.
    pub fn require_pool(&self, conn_hash: &ConnHash) -> Result<Arc<RoutedPool>, ServerError> {
        self.pool(conn_hash).ok_or_else(|| {
            ServerError::InvalidRequest(format!("unknown connection hash {conn_hash}; connect first"))
        })
    }

    pub fn snapshot(&self) -> Vec<RoutedPoolSnapshot> {
        let pools = self
            .pools
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshot = pools
            .values()
            .map(|pool| RoutedPoolSnapshot {
                conn_hash: pool.conn_hash.to_string(),
                kind: pool.kind.to_string(),
                stats: pool.stats(),
            })
            .collect::<Vec<_>>();
        snapshot.sort_by(|a, b| a.conn_hash.cmp(&b.conn_hash));
        snapshot
    }
}
