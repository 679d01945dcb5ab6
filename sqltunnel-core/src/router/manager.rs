//! r2d2 plumbing for routed DuckDB pools.
//!
//! A pool opens its database once and hands out clones of that handle, so
//! every connection of a pool sees the same catalog and committed data.

use std::path::PathBuf;
use std::sync::Mutex;

use duckdb::Connection;
use r2d2::{CustomizeConnection, ManageConnection};
use tracing::{debug, info};

use crate::error::ServerError;

/// Where a routed URL keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    InMemory,
    File(PathBuf),
}

impl DatabaseTarget {
    /// `duckdb:<path>` selects a file database; anything else, including
    /// `duckdb::memory:`, gets an in-memory database private to its pool.
    pub fn from_url(url: &str) -> Self {
        let trimmed = url.trim();
        let lower = trimmed.to_ascii_lowercase();
        let offset = if lower.starts_with("jdbc:duckdb:") {
            "jdbc:duckdb:".len()
        } else if lower.starts_with("duckdb:") {
            "duckdb:".len()
        } else {
            return DatabaseTarget::InMemory;
        };
        let path = &trimmed[offset..];
        if path.is_empty() || path == ":memory:" {
            DatabaseTarget::InMemory
        } else {
            DatabaseTarget::File(PathBuf::from(path))
        }
    }
}

/// r2d2 manager that clones connections off one opened database.
pub struct DuckDbManager {
    template: Mutex<Connection>,
}

impl DuckDbManager {
    pub fn open(target: &DatabaseTarget) -> Result<Self, ServerError> {
        let conn = match target {
            DatabaseTarget::InMemory => Connection::open_in_memory()?,
            DatabaseTarget::File(path) => Connection::open(path)?,
        };
        info!(?target, "opened database for routed pool");
        Ok(Self {
            template: Mutex::new(conn),
        })
    }
}

impl ManageConnection for DuckDbManager {
    type Connection = Connection;
    type Error = ServerError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let template = self
            .template
            .lock()
            .map_err(|_| ServerError::Internal("template connection mutex poisoned".to_string()))?;
        Ok(template.try_clone()?)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.execute_batch("SELECT 1;")?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

/// Runs the configured per-connection setup SQL on every new pooled connection.
#[derive(Debug, Clone)]
pub struct InitOnConnect {
    init_sql: Option<String>,
}

impl InitOnConnect {
    pub fn new(init_sql: Option<&str>) -> Self {
        let init_sql = init_sql
            .map(str::trim)
            .filter(|sql| !sql.is_empty())
            .map(str::to_string);
        Self { init_sql }
    }
}

impl CustomizeConnection<Connection, ServerError> for InitOnConnect {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), ServerError> {
        if let Some(sql) = self.init_sql.as_deref() {
            conn.execute_batch(sql)?;
            debug!("applied connection init sql");
        }
        Ok(())
    }
}

/// Roll back anything a previous holder left open before handing a
/// connection to its next owner.
pub fn reset_on_checkout(conn: &Connection) -> Result<(), ServerError> {
    if let Err(err) = conn.execute_batch("ROLLBACK;") {
        let msg = err.to_string();
        if !msg.contains("no transaction is active") {
            return Err(ServerError::DuckDb(err));
        }
    }
    Ok(())
}
