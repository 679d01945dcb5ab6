use std::sync::Arc;

use tracing::debug;

use crate::error::ServerError;
use crate::metrics::OperationKind;
use crate::session::{BatchEntry, ResultSetMetaDataSnapshot, ResultSetResource, Session, StatementResource};
use crate::sql::StatementKind;
use crate::value::ParameterValue;

use super::{
    arg, arg_bool, arg_i32, arg_i64, arg_text, boolean, int, long, method, null, object, void,
    CallOutcome, Execution, MethodEntry, Target,
};

type Args<'a> = &'a [ParameterValue];
type Outcome = Result<CallOutcome, ServerError>;
type Stmt = StatementResource;

/// `java.sql.Statement`, `PreparedStatement` and `CallableStatement`.
pub(super) const METHODS: &[MethodEntry<StatementResource>] = &[
    method("getMaxRows", 0, get_max_rows),
    method("setMaxRows", 1, set_max_rows),
    method("getFetchSize", 0, get_fetch_size),
    method("setFetchSize", 1, set_fetch_size),
    method("getQueryTimeout", 0, get_query_timeout),
    method("setQueryTimeout", 1, set_query_timeout),
    method("getMaxFieldSize", 0, get_max_field_size),
    method("setMaxFieldSize", 1, set_max_field_size),
    method("isPoolable", 0, is_poolable),
    method("setPoolable", 1, set_poolable),
    method("setEscapeProcessing", 1, set_escape_processing),
    method("isClosed", 0, is_closed),
    method("close", 0, close),
    method("execute", 0, execute),
    method("execute", 1, execute),
    method("executeQuery", 0, execute_query),
    method("executeQuery", 1, execute_query),
    method("executeUpdate", 0, execute_update),
    method("executeUpdate", 1, execute_update),
    method("executeLargeUpdate", 0, execute_large_update),
    method("executeLargeUpdate", 1, execute_large_update),
    method("getResultSet", 0, get_result_set),
    method("getUpdateCount", 0, get_update_count),
    method("getMoreResults", 0, get_more_results),
    method("addBatch", 0, add_batch),
    method("addBatch", 1, add_batch),
    method("clearBatch", 0, clear_batch),
    method("executeBatch", 0, execute_batch),
    method("clearParameters", 0, clear_parameters),
    method("setNull", 2, set_null),
    method("setNull", 3, set_null),
    method("setBoolean", 2, set_value),
    method("setByte", 2, set_value),
    method("setShort", 2, set_value),
    method("setInt", 2, set_value),
    method("setLong", 2, set_value),
    method("setFloat", 2, set_value),
    method("setDouble", 2, set_value),
    method("setBigDecimal", 2, set_value),
    method("setString", 2, set_value),
    method("setNString", 2, set_value),
    method("setBytes", 2, set_value),
    method("setDate", 2, set_value),
    method("setTime", 2, set_value),
    method("setTimestamp", 2, set_value),
    method("setObject", 2, set_value),
    method("setBlob", 2, set_value),
    method("setClob", 2, set_value),
    method("setBinaryStream", 2, set_value),
    method("getMetaData", 0, get_meta_data),
    method("getParameterMetaData", 0, get_parameter_meta_data),
    method("getConnection", 0, get_connection),
];

fn get_max_rows(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    int(i32::try_from(statement.state().max_rows).unwrap_or(i32::MAX))
}

fn set_max_rows(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    let max_rows = arg_i64(args, 0)?;
    if max_rows < 0 {
        return Err(ServerError::InvalidRequest(format!("negative max rows {max_rows}")));
    }
    statement.state().max_rows = max_rows;
    void()
}

fn get_fetch_size(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    int(statement.state().fetch_size)
}

fn set_fetch_size(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    let size = non_negative(args, "fetch size")?;
    statement.state().fetch_size = size;
    void()
}

fn get_query_timeout(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    int(statement.state().query_timeout_secs)
}

fn set_query_timeout(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    let seconds = non_negative(args, "query timeout")?;
    statement.state().query_timeout_secs = seconds;
    void()
}

fn get_max_field_size(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    int(statement.state().max_field_size)
}

fn set_max_field_size(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    let size = non_negative(args, "max field size")?;
    statement.state().max_field_size = size;
    void()
}

fn is_poolable(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    boolean(statement.state().poolable)
}

fn set_poolable(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    statement.state().poolable = arg_bool(args, 0)?;
    void()
}

fn set_escape_processing(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    statement.state().escape_processing = arg_bool(args, 0)?;
    void()
}

fn is_closed(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    boolean(statement.state().closed)
}

/// Closing a statement also closes its current result set.
fn close(session: &Session, statement: &Stmt, _: Args) -> Outcome {
    statement.state().closed = true;
    close_last_result_set(session, statement);
    session.resources().remove_statement(&statement.id());
    void()
}

fn non_negative(args: Args, what: &str) -> Result<i32, ServerError> {
    let value = arg_i32(args, 0)?;
    if value < 0 {
        return Err(ServerError::InvalidRequest(format!("negative {what} {value}")));
    }
    Ok(value)
}

/// SQL passed to the call, or the SQL fixed at prepare time together with
/// the bound parameters.
fn sql_and_parameters(
    statement: &Stmt,
    args: Args,
) -> Result<(String, Vec<ParameterValue>), ServerError> {
    if !args.is_empty() {
        return Ok((arg_text(args, 0)?, Vec::new()));
    }
    let sql = statement.sql().ok_or_else(|| {
        ServerError::InvalidRequest("plain statements need SQL to execute".to_string())
    })?;
    Ok((sql.to_string(), statement.bound_parameters()?))
}

/// SQL an execute-family method would run for a statement prepared with
/// `sql` and holding `batch`. None for every other method.
pub(super) fn planned_execution(
    sql: Option<&str>,
    batch: &[BatchEntry],
    name: &str,
    args: Args,
) -> Option<Execution> {
    let sql = match name {
        "execute" | "executeQuery" | "executeUpdate" | "executeLargeUpdate" => match args.first() {
            Some(arg) => arg.render_text()?,
            None => sql?.to_string(),
        },
        "executeBatch" => match sql {
            Some(sql) => sql.to_string(),
            None => batch
                .iter()
                .filter_map(|entry| match entry {
                    BatchEntry::Sql(sql) => Some(sql.as_str()),
                    BatchEntry::Parameters(_) => None,
                })
                .collect::<Vec<_>>()
                .join(";\n"),
        },
        _ => return None,
    };
    if sql.trim().is_empty() {
        return None;
    }
    let kind = match name {
        "executeQuery" => OperationKind::Query,
        "execute" if StatementKind::classify(&sql).is_query() => OperationKind::Query,
        _ => OperationKind::Update,
    };
    Some(Execution { sql, kind })
}

/// Run SQL on behalf of `statement`, recording its result set or update
/// count. Returns true when the SQL produced a result set.
pub(crate) fn run_sql(
    session: &Session,
    statement: &Stmt,
    sql: &str,
    params: &[ParameterValue],
) -> Result<bool, ServerError> {
    if StatementKind::classify(sql).is_query() {
        run_query(session, statement, sql, params)?;
        Ok(true)
    } else {
        run_update(session, statement, sql, params)?;
        Ok(false)
    }
}

fn close_last_result_set(session: &Session, statement: &Stmt) {
    let previous = statement.state().last_result_set.take();
    if let Some(id) = previous {
        if let Some(result_set) = session.resources().remove_result_set(&id) {
            result_set.close();
        }
    }
}

/// Run a query for `statement` and register its result set as the current one.
pub(crate) fn run_query(
    session: &Session,
    statement: &Stmt,
    sql: &str,
    params: &[ParameterValue],
) -> Result<Arc<ResultSetResource>, ServerError> {
    close_last_result_set(session, statement);
    let max_rows = statement.state().max_rows;
    let result = session.execute_query(sql, params)?;
    let result_set = ResultSetResource::new(
        result,
        Some(statement.id()),
        &session.capabilities(),
        max_rows,
    );
    let result_set = session.resources().register_result_set(result_set);
    let fetch_size = statement.state().fetch_size;
    result_set.set_fetch_size(fetch_size)?;
    let mut state = statement.state();
    state.last_result_set = Some(result_set.id());
    state.last_update_count = -1;
    debug!(statement_id = %statement.id(), result_set_id = %result_set.id(), "statement produced a result set");
    Ok(result_set)
}

/// Run DDL or DML for `statement` and record its update count.
pub(crate) fn run_update(
    session: &Session,
    statement: &Stmt,
    sql: &str,
    params: &[ParameterValue],
) -> Result<i64, ServerError> {
    close_last_result_set(session, statement);
    let count = session.execute_update(sql, params)?;
    statement.state().last_update_count = count;
    Ok(count)
}

fn current_result_set(session: &Session, statement: &Stmt) -> Result<Option<Arc<ResultSetResource>>, ServerError> {
    let last = statement.state().last_result_set;
    last.map(|id| session.resources().result_set(&id)).transpose()
}

fn execute(session: &Session, statement: &Stmt, args: Args) -> Outcome {
    let (sql, params) = sql_and_parameters(statement, args)?;
    boolean(run_sql(session, statement, &sql, &params)?)
}

fn execute_query(session: &Session, statement: &Stmt, args: Args) -> Outcome {
    let (sql, params) = sql_and_parameters(statement, args)?;
    if !run_sql(session, statement, &sql, &params)? {
        return Err(ServerError::InvalidRequest(
            "executeQuery ran a statement that returns no result set".to_string(),
        ));
    }
    match current_result_set(session, statement)? {
        Some(result_set) => object(Target::ResultSet(result_set)),
        None => Err(ServerError::Internal("result set vanished after execution".to_string())),
    }
}

fn update_count(session: &Session, statement: &Stmt, args: Args) -> Result<i64, ServerError> {
    let (sql, params) = sql_and_parameters(statement, args)?;
    if run_sql(session, statement, &sql, &params)? {
        return Err(ServerError::InvalidRequest(
            "executeUpdate ran a statement that returns a result set".to_string(),
        ));
    }
    Ok(statement.state().last_update_count)
}

fn execute_update(session: &Session, statement: &Stmt, args: Args) -> Outcome {
    int(i32::try_from(update_count(session, statement, args)?).unwrap_or(i32::MAX))
}

fn execute_large_update(session: &Session, statement: &Stmt, args: Args) -> Outcome {
    long(update_count(session, statement, args)?)
}

fn get_result_set(session: &Session, statement: &Stmt, _: Args) -> Outcome {
    match current_result_set(session, statement)? {
        Some(result_set) => object(Target::ResultSet(result_set)),
        None => null(),
    }
}

fn get_update_count(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    int(i32::try_from(statement.state().last_update_count).unwrap_or(i32::MAX))
}

/// Statements yield at most one result, so there is never a next one.
fn get_more_results(session: &Session, statement: &Stmt, _: Args) -> Outcome {
    close_last_result_set(session, statement);
    statement.state().last_update_count = -1;
    boolean(false)
}

fn add_batch(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    let entry = if args.is_empty() {
        if statement.sql().is_none() {
            return Err(ServerError::InvalidRequest(
                "addBatch without SQL on a plain statement".to_string(),
            ));
        }
        BatchEntry::Parameters(statement.bound_parameters()?)
    } else {
        BatchEntry::Sql(arg_text(args, 0)?)
    };
    statement.state().batch.push(entry);
    void()
}

fn clear_batch(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    statement.state().batch.clear();
    void()
}

/// Run every queued entry in order; the batch is cleared whatever the outcome.
fn execute_batch(session: &Session, statement: &Stmt, _: Args) -> Outcome {
    let batch = std::mem::take(&mut statement.state().batch);
    let mut counts = Vec::with_capacity(batch.len());
    for entry in batch {
        let count = match entry {
            BatchEntry::Sql(sql) => session.execute_update(&sql, &[])?,
            BatchEntry::Parameters(params) => {
                let sql = statement.sql().ok_or_else(|| {
                    ServerError::Internal("parameter batch on a plain statement".to_string())
                })?;
                session.execute_update(sql, &params)?
            }
        };
        counts.push(ParameterValue::Int(i32::try_from(count).unwrap_or(i32::MAX)));
    }
    Ok(CallOutcome::Values(counts))
}

fn clear_parameters(_: &Session, statement: &Stmt, _: Args) -> Outcome {
    statement.state().parameters.clear();
    void()
}

fn parameter_index(args: Args) -> Result<usize, ServerError> {
    let index = arg_i64(args, 0)?;
    usize::try_from(index)
        .ok()
        .filter(|i| *i > 0)
        .ok_or_else(|| ServerError::InvalidRequest(format!("invalid parameter index {index}")))
}

fn set_null(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    let index = parameter_index(args)?;
    let sql_type = arg_i32(args, 1)?;
    statement.set_parameter(index, ParameterValue::Null(sql_type))?;
    void()
}

fn set_value(_: &Session, statement: &Stmt, args: Args) -> Outcome {
    let index = parameter_index(args)?;
    statement.set_parameter(index, arg(args, 1)?.clone())?;
    void()
}

fn prepared_sql(statement: &Stmt) -> Result<&str, ServerError> {
    statement.sql().ok_or_else(|| {
        ServerError::UnsupportedOperation("metadata of a plain statement".to_string())
    })
}

/// Result shape of a prepared query, found by running it with no rows.
fn get_meta_data(session: &Session, statement: &Stmt, _: Args) -> Outcome {
    let sql = prepared_sql(statement)?;
    if !StatementKind::classify(sql).is_query() {
        return null();
    }
    let inner = sql.trim().trim_end_matches(';');
    let shape_sql = format!("SELECT * FROM ({inner}) AS sqltunnel_shape LIMIT 0");
    let placeholders = session.run(|conn| conn.parameter_count(&shape_sql))?;
    let nulls = vec![ParameterValue::Null(0); placeholders];
    let result = session.execute_query(&shape_sql, &nulls)?;
    let snapshot = ResultSetMetaDataSnapshot::from_schema(&result.schema, &session.capabilities());
    object(Target::ResultSetMetaData(Arc::new(snapshot)))
}

fn get_parameter_meta_data(session: &Session, statement: &Stmt, _: Args) -> Outcome {
    let sql = prepared_sql(statement)?;
    let parameter_count = session.run(|conn| conn.parameter_count(sql))?;
    object(Target::ParameterMetaData { parameter_count })
}

fn get_connection(_: &Session, _: &Stmt, _: Args) -> Outcome {
    object(Target::Connection)
}
