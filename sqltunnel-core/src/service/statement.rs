//! connect, executeUpdate, executeQuery, fetchNextRows and terminateSession.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, Span};

use super::rows::encode_block;
use super::{blocking, wait_for_lobs, BreakerGuard, Lease, ProtocolService};
use crate::dispatch::{run_query, run_update};
use crate::error::ServerError;
use crate::fingerprint::OperationFingerprint;
use crate::metrics::OperationKind;
use crate::protocol::{
    ConnectRequest, FetchRequest, OpResult, RowBlock, SessionInfo, SessionTerminationStatus,
    StatementRequest,
};
use crate::router::RouteRequest;
use crate::session::{ResourceId, ResourceKind, ResultSetResource, Session, SessionId, StatementResource};
use crate::value::ParameterValue;

const MAX_ROWS_KEY: &str = "max_rows";
const FETCH_SIZE_KEY: &str = "fetch_size";

/// Per-call overrides carried in request properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StatementOptions {
    max_rows: Option<i64>,
    fetch_size: Option<i32>,
}

impl StatementOptions {
    fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ServerError> {
        fn parse<T: std::str::FromStr>(
            properties: &HashMap<String, String>,
            key: &str,
        ) -> Result<Option<T>, ServerError> {
            properties
                .get(key)
                .map(|raw| {
                    raw.trim().parse::<T>().map_err(|_| {
                        ServerError::InvalidRequest(format!("property {key} is not a number: {raw}"))
                    })
                })
                .transpose()
        }
        let options = Self {
            max_rows: parse(properties, MAX_ROWS_KEY)?,
            fetch_size: parse(properties, FETCH_SIZE_KEY)?,
        };
        if options.max_rows.is_some_and(|rows| rows < 0)
            || options.fetch_size.is_some_and(|size| size < 0)
        {
            return Err(ServerError::InvalidRequest(
                "max_rows and fetch_size must not be negative".to_string(),
            ));
        }
        Ok(options)
    }

    fn apply_to(&self, statement: &StatementResource) {
        let mut state = statement.state();
        if let Some(max_rows) = self.max_rows {
            state.max_rows = max_rows;
        }
        if let Some(fetch_size) = self.fetch_size {
            state.fetch_size = fetch_size;
        }
    }
}

/// What a statement request resolved to inside its session.
struct Prepared {
    statement: Option<Arc<StatementResource>>,
    sql: String,
    params: Vec<ParameterValue>,
    options: StatementOptions,
}

impl Prepared {
    /// A named statement supplies its SQL and bound parameters when the
    /// request leaves them out.
    fn resolve(session: &Session, request: &StatementRequest) -> Result<Self, ServerError> {
        let params = ParameterValue::from_wire_list(&request.parameters)?;
        let options = StatementOptions::from_properties(&request.properties)?;
        if request.statement_uuid.is_empty() {
            if request.sql.trim().is_empty() {
                return Err(ServerError::InvalidRequest(
                    "statement request carries no SQL".to_string(),
                ));
            }
            return Ok(Self {
                statement: None,
                sql: request.sql.clone(),
                params,
                options,
            });
        }

        let statement = session
            .resources()
            .statement(&ResourceId::parse(&request.statement_uuid)?)?;
        statement.ensure_open()?;
        options.apply_to(&statement);
        let (sql, params) = if request.sql.is_empty() {
            let sql = statement.sql().ok_or_else(|| {
                ServerError::InvalidRequest(format!(
                    "statement {} has no SQL of its own",
                    statement.id()
                ))
            })?;
            let params = if params.is_empty() {
                statement.bound_parameters()?
            } else {
                params
            };
            (sql.to_string(), params)
        } else {
            (request.sql.clone(), params)
        };
        Ok(Self {
            statement: Some(statement),
            sql,
            params,
            options,
        })
    }
}

impl ProtocolService {
    /// Register the data source and return a shell without a session.
    /// Building a pool opens the database, so it runs on the blocking pool.
    #[instrument(skip(self, request), fields(url = %request.url, client_id = %request.client_uuid, conn_hash))]
    pub async fn connect(&self, request: ConnectRequest) -> Result<SessionInfo, ServerError> {
        let router = self.router.clone();
        let client_uuid = request.client_uuid.clone();
        let pool = blocking(move || {
            router.route_for(&RouteRequest {
                url: &request.url,
                user: &request.user,
                password: &request.password,
                datasource_name: &request.datasource_name,
                properties: &request.properties,
            })
        })
        .await?;
        Span::current().record("conn_hash", tracing::field::display(pool.conn_hash()));
        info!(kind = %pool.kind(), "client connected");
        Ok(SessionInfo {
            session_uuid: String::new(),
            conn_hash: pool.conn_hash().to_string(),
            client_uuid,
            transaction: None,
        })
    }

    /// Steps shared by both execute calls: breaker, session, statement, LOBs.
    async fn begin_statement(
        &self,
        request: &StatementRequest,
    ) -> Result<(Lease, Prepared, BreakerGuard), ServerError> {
        let shell = request.session.clone().unwrap_or_default();
        let early = if request.sql.is_empty() {
            None
        } else {
            Some(self.guard(OperationFingerprint::of_sql(&request.sql))?)
        };
        let lease = self.lease(&shell).await?;
        let prepared = Prepared::resolve(lease.session(), request)?;
        let guard = match early {
            Some(guard) => guard,
            None => self.guard(OperationFingerprint::of_sql(&prepared.sql))?,
        };
        Span::current().record("fingerprint", tracing::field::display(guard.fingerprint()));
        wait_for_lobs(lease.session(), &prepared.params).await?;
        Ok((lease, prepared, guard))
    }

    #[instrument(skip(self, request), fields(session_id = request.session.as_ref().map(|s| s.session_uuid.as_str()), fingerprint))]
    pub async fn execute_update(&self, request: StatementRequest) -> Result<OpResult, ServerError> {
        let (mut lease, prepared, guard) = self.begin_statement(&request).await?;
        let session = lease.session().clone();
        let statement = prepared.statement.clone();
        let (sql, params) = (prepared.sql.clone(), prepared.params.clone());

        let _in_flight = self.monitor.start(OperationKind::Update);
        let started = Instant::now();
        let result = blocking(move || match statement {
            Some(statement) => run_update(&session, &statement, &sql, &params),
            None => session.execute_update(&sql, &params),
        })
        .await;
        self.observe(guard.fingerprint(), &prepared.sql, OperationKind::Update, started, &result, |count| {
            u64::try_from(*count).ok()
        });
        guard.settle(&result);
        let update_count = self.settle(lease.session(), result)?;

        if lease.session().transaction_id().is_some() {
            lease.promote(&self.sessions)?;
        }
        debug!(update_count, "update executed");
        Ok(OpResult {
            session: Some(lease.shell()),
            update_count,
            statement_uuid: prepared
                .statement
                .map(|statement| statement.id().to_string())
                .unwrap_or_default(),
            rows: None,
        })
    }

    /// Run a query and return its first block. A one-shot call becomes a
    /// session when rows remain, LOB handles were emitted or a transaction
    /// is open; otherwise the result set dies with the call.
    #[instrument(skip(self, request), fields(session_id = request.session.as_ref().map(|s| s.session_uuid.as_str()), fingerprint))]
    pub async fn execute_query(&self, request: StatementRequest) -> Result<OpResult, ServerError> {
        let (mut lease, prepared, guard) = self.begin_statement(&request).await?;
        let session = lease.session().clone();
        let statement = prepared.statement.clone();
        let (sql, params, options) = (prepared.sql.clone(), prepared.params.clone(), prepared.options);
        let limits = self.limits;

        let _in_flight = self.monitor.start(OperationKind::Query);
        let started = Instant::now();
        let result = blocking(move || {
            let result_set = match statement {
                Some(statement) => run_query(&session, &statement, &sql, &params)?,
                None => {
                    let result = session.execute_query(&sql, &params)?;
                    let result_set = ResultSetResource::new(
                        result,
                        None,
                        &session.capabilities(),
                        options.max_rows.unwrap_or(0),
                    );
                    result_set.set_fetch_size(options.fetch_size.unwrap_or(0))?;
                    session.resources().register_result_set(result_set)
                }
            };
            let size = limits.block_size(0, result_set.fetch_size());
            let encoded = encode_block(
                &session,
                &result_set,
                size,
                true,
                limits.lob_inline_threshold,
            )?;
            Ok((result_set, encoded))
        })
        .await;
        self.observe(guard.fingerprint(), &prepared.sql, OperationKind::Query, started, &result, |(rs, _)| {
            Some(rs.row_count() as u64)
        });
        guard.settle(&result);
        let (result_set, encoded) = self.settle(lease.session(), result)?;

        let mut block = encoded.block;
        let needs_session = !block.last
            || encoded.lob_handles > 0
            || lease.session().transaction_id().is_some();
        if needs_session {
            lease.promote(&self.sessions)?;
        } else if !lease.registered {
            lease.session().resources().remove_result_set(&result_set.id());
            block.result_set_uuid.clear();
        }
        debug!(rows = block.rows.len(), last = block.last, "query executed");
        Ok(OpResult {
            session: Some(lease.shell()),
            update_count: -1,
            statement_uuid: prepared
                .statement
                .map(|statement| statement.id().to_string())
                .unwrap_or_default(),
            rows: Some(block),
        })
    }

    /// Next block of a registered result set. Once exhausted every call
    /// returns an empty block marked last.
    #[instrument(skip(self, request), fields(session_id, result_set_id = %request.result_set_uuid))]
    pub async fn fetch_next_rows(&self, request: FetchRequest) -> Result<RowBlock, ServerError> {
        let shell = request.session.unwrap_or_default();
        Span::current().record("session_id", shell.session_uuid.as_str());
        if !shell.has_session() {
            return Err(ServerError::resource_not_found(
                ResourceKind::ResultSet,
                &request.result_set_uuid,
            ));
        }
        let session = self.sessions.get(&shell)?;
        let result_set = session
            .resources()
            .result_set(&ResourceId::parse(&request.result_set_uuid)?)?;
        let size = self.limits.block_size(request.size, result_set.fetch_size());
        let threshold = self.limits.lob_inline_threshold;
        let worker = session.clone();
        let result = blocking(move || {
            worker.touch();
            encode_block(&worker, &result_set, size, false, threshold)
        })
        .await;
        Ok(self.settle(&session, result)?.block)
    }

    /// Remove the session at once and release it in the background.
    #[instrument(skip(self, shell), fields(session_id = %shell.session_uuid))]
    pub fn terminate_session(&self, shell: &SessionInfo) -> SessionTerminationStatus {
        let terminated = shell.has_session()
            && self.sessions.get(shell).is_ok()
            && self
                .sessions
                .terminate(&SessionId::from_string(shell.session_uuid.clone()));
        debug!(terminated, "terminate session requested");
        SessionTerminationStatus { terminated }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;
    use crate::protocol::wire_value::Kind;
    use crate::service::tests::{connect, test_service};

    fn statement(session: &SessionInfo, sql: &str) -> StatementRequest {
        StatementRequest {
            session: Some(session.clone()),
            sql: sql.to_string(),
            ..StatementRequest::default()
        }
    }

    #[test]
    fn options_reject_negative_and_garbage_values() {
        let mut props = HashMap::new();
        props.insert(MAX_ROWS_KEY.to_string(), "10".to_string());
        assert_eq!(
            StatementOptions::from_properties(&props).ok(),
            Some(StatementOptions {
                max_rows: Some(10),
                fetch_size: None
            })
        );
        props.insert(FETCH_SIZE_KEY.to_string(), "-1".to_string());
        assert!(StatementOptions::from_properties(&props).is_err());
        props.insert(FETCH_SIZE_KEY.to_string(), "lots".to_string());
        assert!(StatementOptions::from_properties(&props).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn small_one_shot_query_leaves_no_session() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        let result = service
            .execute_query(statement(&shell, "SELECT 42 AS answer"))
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        let block = result.rows.ok_or_else(|| anyhow!("query returned no rows"))?;
        assert!(block.last);
        assert!(block.result_set_uuid.is_empty());
        assert_eq!(block.labels, vec!["answer"]);
        assert!(matches!(block.rows[0].values[0].kind, Some(Kind::Int(42))));
        assert!(result.session.is_some_and(|s| s.session_uuid.is_empty()));
        assert!(service.sessions().is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn paged_query_promotes_to_a_session() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        let mut request = statement(&shell, "SELECT * FROM range(10)");
        request
            .properties
            .insert(FETCH_SIZE_KEY.to_string(), "4".to_string());
        let result = service
            .execute_query(request)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        let session = result.session.ok_or_else(|| anyhow!("no session shell"))?;
        let first = result.rows.ok_or_else(|| anyhow!("query returned no rows"))?;
        assert!(session.has_session());
        assert_eq!(first.rows.len(), 4);
        assert!(!first.last);

        let mut fetched = first.rows.len();
        loop {
            let block = service
                .fetch_next_rows(FetchRequest {
                    session: Some(session.clone()),
                    result_set_uuid: first.result_set_uuid.clone(),
                    size: 0,
                })
                .await
                .map_err(|e| anyhow!(e.to_string()))?;
            fetched += block.rows.len();
            if block.last {
                break;
            }
        }
        assert_eq!(fetched, 10);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sql_begin_on_a_one_shot_call_keeps_the_session() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        let result = service
            .execute_update(statement(&shell, "BEGIN TRANSACTION"))
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        let session = result.session.ok_or_else(|| anyhow!("no session shell"))?;
        assert!(session.has_session());
        assert!(session.transaction.is_some());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminate_is_false_for_unknown_sessions() -> Result<()> {
        let service = test_service();
        let mut shell = connect(&service).await?;
        assert!(!service.terminate_session(&shell).terminated);
        shell.session_uuid = "missing".to_string();
        assert!(!service.terminate_session(&shell).terminated);
        Ok(())
    }
}
