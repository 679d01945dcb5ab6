//! DuckDB connection wrapper with query execution methods.
//!
//! A connection is owned either by one session for its whole lifetime or by
//! a single one-shot call; releasing it hands the pooled handle back to r2d2.

use std::sync::Mutex;

use duckdb::arrow::datatypes::SchemaRef;
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::types::Value;
use duckdb::{params_from_iter, Connection};
use r2d2::PooledConnection;
use tracing::{debug, instrument, warn};

use crate::error::ServerError;
use crate::router::DuckDbManager;

/// Materialised result of a query.
pub struct QueryResult {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub total_rows: usize,
    pub total_bytes: usize,
}

/// Wrapper around a pooled duckdb::Connection.
///
/// The Connection is wrapped in a Mutex because duckdb::Connection contains
/// RefCell internally and is not Sync.
pub struct DuckDbConnection {
    conn: Mutex<Option<PooledConnection<DuckDbManager>>>,
    max_result_bytes: usize,
}

impl DuckDbConnection {
    pub fn new(conn: PooledConnection<DuckDbManager>, max_result_bytes: usize) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            max_result_bytes,
        }
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| ServerError::Internal("connection mutex poisoned".to_string()))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ServerError::SessionClosed("connection already released".to_string()))?;
        f(conn)
    }

    /// Hand the pooled connection back. Later calls fail with `SessionClosed`.
    pub fn release(&self) -> bool {
        let taken = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        taken.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }

    /// Execute a query and materialise its batches. Fails with
    /// `ResultTooLarge` as soon as the batches pulled so far exceed the
    /// connection's result limit; the rest of the result is never read.
    #[instrument(skip(self, params), fields(sql = %sql, param_count = params.len()))]
    pub fn execute_query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, ServerError> {
        reject_nul(sql)?;
        let limit = self.max_result_bytes;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let arrow = stmt.query_arrow(params_from_iter(params.iter()))?;
            let schema = arrow.get_schema();

            let mut total_rows = 0usize;
            let mut total_bytes = 0usize;
            let mut batches: Vec<RecordBatch> = Vec::new();
            for batch in arrow {
                total_rows += batch.num_rows();
                total_bytes += batch.get_array_memory_size();
                if total_bytes > limit {
                    warn!(total_rows, total_bytes, limit, "query result over the size limit");
                    return Err(ServerError::ResultTooLarge { limit_bytes: limit });
                }
                batches.push(batch);
            }

            debug!(
                batch_count = batches.len(),
                total_rows, total_bytes, "executed query"
            );
            Ok(QueryResult {
                schema,
                batches,
                total_rows,
                total_bytes,
            })
        })
    }

    /// Execute DDL or DML and return the affected row count.
    #[instrument(skip(self, params), fields(sql = %sql, param_count = params.len()))]
    pub fn execute_update(&self, sql: &str, params: &[Value]) -> Result<usize, ServerError> {
        reject_nul(sql)?;
        let affected = self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            Ok(stmt.execute(params_from_iter(params.iter()))?)
        })?;
        debug!(affected, "executed update");
        Ok(affected)
    }

    /// Execute one or more statements without parameters or results.
    #[instrument(skip(self), fields(sql = %sql))]
    pub fn execute_batch(&self, sql: &str) -> Result<(), ServerError> {
        reject_nul(sql)?;
        self.with_conn(|conn| Ok(conn.execute_batch(sql)?))?;
        debug!("executed batch");
        Ok(())
    }

    /// Number of `?` placeholders in a statement.
    pub fn parameter_count(&self, sql: &str) -> Result<usize, ServerError> {
        reject_nul(sql)?;
        self.with_conn(|conn| Ok(conn.prepare(sql)?.parameter_count()))
    }

    /// Return the currently selected catalog (database) for this connection.
    pub fn current_catalog(&self) -> Result<String, ServerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT current_database()")?;
            Ok(stmt.query_row([], |row| row.get(0))?)
        })
    }

    /// Return the current schema for this connection.
    pub fn current_schema(&self) -> Result<String, ServerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT current_schema()")?;
            Ok(stmt.query_row([], |row| row.get(0))?)
        })
    }

    /// Switch the default catalog or schema.
    pub fn use_target(&self, target: &str) -> Result<(), ServerError> {
        let quoted = quote_identifier(target);
        self.execute_batch(&format!("USE {quoted}"))
    }
}

fn reject_nul(sql: &str) -> Result<(), ServerError> {
    if sql.contains('\0') {
        return Err(ServerError::InvalidRequest(
            "SQL contains null bytes".to_string(),
        ));
    }
    Ok(())
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;
    use crate::router::{DatabaseTarget, DuckDbManager};

    fn pooled_with_limit(max_result_bytes: usize) -> Result<DuckDbConnection> {
        let manager =
            DuckDbManager::open(&DatabaseTarget::InMemory).map_err(|e| anyhow!(e.to_string()))?;
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        Ok(DuckDbConnection::new(pool.get()?, max_result_bytes))
    }

    fn pooled() -> Result<DuckDbConnection> {
        pooled_with_limit(usize::MAX)
    }

    #[test]
    fn executes_updates_and_queries_with_parameters() -> Result<()> {
        let conn = pooled()?;
        conn.execute_batch("CREATE TABLE t(id INT, name VARCHAR)")
            .map_err(|e| anyhow!(e.to_string()))?;
        let inserted = conn
            .execute_update(
                "INSERT INTO t VALUES (?, ?), (?, ?)",
                &[
                    Value::Int(1),
                    Value::Text("a".to_string()),
                    Value::Int(2),
                    Value::Text("b".to_string()),
                ],
            )
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(inserted, 2);

        let result = conn
            .execute_query("SELECT name FROM t WHERE id > ?", &[Value::Int(1)])
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(result.total_rows, 1);
        assert_eq!(result.schema.fields().len(), 1);
        assert_eq!(conn.parameter_count("SELECT ? + ?").map_err(|e| anyhow!(e.to_string()))?, 2);
        Ok(())
    }

    #[test]
    fn results_over_the_size_limit_are_refused() -> Result<()> {
        let conn = pooled_with_limit(64 * 1024)?;
        let small = conn
            .execute_query("SELECT 42 AS answer", &[])
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(small.total_rows, 1);
        assert!(small.total_bytes <= 64 * 1024);

        let err = conn
            .execute_query("SELECT range AS n, repeat('x', 64) AS pad FROM range(200000)", &[])
            .err()
            .ok_or_else(|| anyhow!("expected the large result to be refused"))?;
        assert!(matches!(err, ServerError::ResultTooLarge { limit_bytes } if limit_bytes == 64 * 1024));

        let after = conn
            .execute_query("SELECT 1", &[])
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(after.total_rows, 1);
        Ok(())
    }

    #[test]
    fn released_connection_rejects_further_work() -> Result<()> {
        let conn = pooled()?;
        assert!(conn.release());
        assert!(conn.is_released());
        assert!(!conn.release());
        let err = conn
            .execute_batch("SELECT 1")
            .err()
            .ok_or_else(|| anyhow!("expected released connection to fail"))?;
        assert!(matches!(err, ServerError::SessionClosed(_)));
        Ok(())
    }

    #[test]
    fn nul_bytes_are_rejected() -> Result<()> {
        let conn = pooled()?;
        assert!(matches!(
            conn.execute_batch("SELECT 1\0"),
            Err(ServerError::InvalidRequest(_))
        ));
        Ok(())
    }
}
