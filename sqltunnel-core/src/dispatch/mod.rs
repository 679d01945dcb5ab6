//! Closed dispatch tables behind `callResource`.
//!
//! A call descriptor names a method as verb prefix plus resource name
//! (`get` + `AutoCommit`). Each interface family has a static table mapping
//! (method name, arity) to a plain function, so every callable method is
//! known at compile time. Results that are driver objects come back as
//! [`Target`]s; the caller registers them and hands out a handle instead of
//! a value. Exactly one chained call may follow the first.

mod connection;
mod lob;
mod metadata;
mod result_set;
mod statement;

pub(crate) use statement::{run_query, run_update};

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::ServerError;
use crate::lob::LobResource;
use crate::metrics::OperationKind;
use crate::protocol::{CallTarget, CallType, ResourceType};
use crate::session::{
    Attribute, ResourceId, ResultSetMetaDataSnapshot, ResultSetResource, Session,
    StatementResource,
};
use crate::value::ParameterValue;

/// Resolved object a call runs against.
#[derive(Clone)]
pub enum Target {
    Connection,
    Statement(Arc<StatementResource>),
    ResultSet(Arc<ResultSetResource>),
    ResultSetMetaData(Arc<ResultSetMetaDataSnapshot>),
    ParameterMetaData { parameter_count: usize },
    DatabaseMetaData,
    Savepoint(SavepointRef),
    Lob(Arc<LobResource>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavepointRef {
    pub id: i32,
    pub name: Option<String>,
}

impl SavepointRef {
    /// Engine-side savepoint name.
    pub fn sql_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("sqltunnel_sp_{}", self.id),
        }
    }
}

impl Target {
    fn interface(&self) -> &'static str {
        match self {
            Target::Connection => "Connection",
            Target::Statement(_) => "Statement",
            Target::ResultSet(_) => "ResultSet",
            Target::ResultSetMetaData(_) => "ResultSetMetaData",
            Target::ParameterMetaData { .. } => "ParameterMetaData",
            Target::DatabaseMetaData => "DatabaseMetaData",
            Target::Savepoint(_) => "Savepoint",
            Target::Lob(_) => "Lob",
        }
    }

    /// Resolve a descriptor's resource inside `session`.
    pub fn resolve(
        session: &Session,
        resource_type: ResourceType,
        id: &ResourceId,
    ) -> Result<Self, ServerError> {
        let resources = session.resources();
        Ok(match resource_type {
            ResourceType::Connection => Target::Connection,
            ResourceType::Statement
            | ResourceType::PreparedStatement
            | ResourceType::CallableStatement => {
                let statement = resources.statement(id)?;
                statement.ensure_open()?;
                Target::Statement(statement)
            }
            ResourceType::ResultSet => Target::ResultSet(resources.result_set(id)?),
            ResourceType::Lob => Target::Lob(resources.lob(id)?),
            ResourceType::ResultSetMetaData
            | ResourceType::DatabaseMetaData
            | ResourceType::ParameterMetaData
            | ResourceType::Savepoint => {
                let attribute = resources.attribute(id)?;
                Self::from_attribute(attribute.as_ref())
            }
            ResourceType::Unspecified => {
                return Err(ServerError::InvalidRequest(
                    "call descriptor without a resource type".to_string(),
                ))
            }
        })
    }

    fn from_attribute(attribute: &Attribute) -> Self {
        match attribute {
            Attribute::ResultSetMetaData(snapshot) => Target::ResultSetMetaData(snapshot.clone()),
            Attribute::ParameterMetaData { parameter_count } => Target::ParameterMetaData {
                parameter_count: *parameter_count,
            },
            Attribute::DatabaseMetaData => Target::DatabaseMetaData,
            Attribute::Savepoint { id, name } => Target::Savepoint(SavepointRef {
                id: *id,
                name: name.clone(),
            }),
        }
    }

    /// Register the object under `session` and return its handle. Statements,
    /// result sets and LOBs are registered when created; the connection has
    /// no handle of its own.
    pub fn register(&self, session: &Session) -> Option<ResourceId> {
        let resources = session.resources();
        match self {
            Target::Connection => None,
            Target::Statement(statement) => Some(statement.id()),
            Target::ResultSet(result_set) => Some(result_set.id()),
            Target::Lob(lob) => Some(lob.id()),
            Target::ResultSetMetaData(snapshot) => Some(
                resources.register_attribute(Attribute::ResultSetMetaData(snapshot.clone())),
            ),
            Target::ParameterMetaData { parameter_count } => {
                Some(resources.register_attribute(Attribute::ParameterMetaData {
                    parameter_count: *parameter_count,
                }))
            }
            Target::DatabaseMetaData => {
                Some(resources.register_attribute(Attribute::DatabaseMetaData))
            }
            Target::Savepoint(savepoint) => Some(resources.register_attribute(
                Attribute::Savepoint {
                    id: savepoint.id,
                    name: savepoint.name.clone(),
                },
            )),
        }
    }
}

/// What a dispatched method produced.
pub enum CallOutcome {
    Void,
    Value(ParameterValue),
    Values(Vec<ParameterValue>),
    Object(Target),
}

type Handler<T> = fn(&Session, &T, &[ParameterValue]) -> Result<CallOutcome, ServerError>;

/// One row of a dispatch table.
pub struct MethodEntry<T> {
    pub name: &'static str,
    pub arity: usize,
    pub handler: Handler<T>,
}

const fn method<T>(name: &'static str, arity: usize, handler: Handler<T>) -> MethodEntry<T> {
    MethodEntry {
        name,
        arity,
        handler,
    }
}

fn lookup<'t, T>(
    table: &'t [MethodEntry<T>],
    interface: &str,
    name: &str,
    arity: usize,
) -> Result<&'t MethodEntry<T>, ServerError> {
    let mut arities = table.iter().filter(|entry| entry.name == name).peekable();
    if arities.peek().is_none() {
        return Err(ServerError::UnsupportedOperation(format!(
            "{interface}.{name} is not available"
        )));
    }
    let known: Vec<usize> = arities.map(|entry| entry.arity).collect();
    table
        .iter()
        .find(|entry| entry.name == name && entry.arity == arity)
        .ok_or_else(|| {
            ServerError::UnsupportedOperation(format!(
                "{interface}.{name} takes {known:?} argument(s), got {arity}"
            ))
        })
}

fn apply<T>(
    table: &[MethodEntry<T>],
    interface: &str,
    name: &str,
    session: &Session,
    target: &T,
    args: &[ParameterValue],
) -> Result<CallOutcome, ServerError> {
    let entry = lookup(table, interface, name, args.len())?;
    (entry.handler)(session, target, args)
}

/// Method name for a verb and resource name.
pub fn method_name(call_type: CallType, resource_name: &str) -> String {
    let prefix = call_type.prefix();
    if prefix.is_empty() {
        let mut chars = resource_name.chars();
        match chars.next() {
            Some(first) => first.to_lowercase().chain(chars).collect(),
            None => String::new(),
        }
    } else {
        format!("{prefix}{resource_name}")
    }
}

/// Invoke one method on a resolved target.
pub fn invoke_method(
    session: &Session,
    target: &Target,
    name: &str,
    args: &[ParameterValue],
) -> Result<CallOutcome, ServerError> {
    let interface = target.interface();
    debug!(interface, method = name, arity = args.len(), "dispatching call");
    match target {
        Target::Connection => apply(connection::METHODS, interface, name, session, &(), args),
        Target::Statement(statement) => apply(
            statement::METHODS,
            interface,
            name,
            session,
            statement.as_ref(),
            args,
        ),
        Target::ResultSet(result_set) => apply(
            result_set::METHODS,
            interface,
            name,
            session,
            result_set.as_ref(),
            args,
        ),
        Target::ResultSetMetaData(snapshot) => apply(
            metadata::RESULT_SET_METADATA,
            interface,
            name,
            session,
            snapshot.as_ref(),
            args,
        ),
        Target::ParameterMetaData { parameter_count } => apply(
            metadata::PARAMETER_METADATA,
            interface,
            name,
            session,
            parameter_count,
            args,
        ),
        Target::DatabaseMetaData => apply(
            metadata::DATABASE_METADATA,
            interface,
            name,
            session,
            &(),
            args,
        ),
        Target::Savepoint(savepoint) => apply(
            metadata::SAVEPOINT,
            interface,
            name,
            session,
            savepoint,
            args,
        ),
        Target::Lob(lob) => apply(lob::METHODS, interface, name, session, lob.as_ref(), args),
    }
}

/// SQL a descriptor runs and the kind of statement it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub sql: String,
    pub kind: OperationKind,
}

/// The SQL a descriptor will execute, worked out without running it.
/// Covers execute calls on a statement and a connection call that creates
/// a statement and chains into one.
pub fn execution_of(target: &Target, call: &CallTarget) -> Result<Option<Execution>, ServerError> {
    let name = method_name(call_type_of(call)?, &call.resource_name);
    let args = ParameterValue::from_wire_list(&call.params)?;
    match target {
        Target::Statement(statement) => {
            let batch = statement.state().batch.clone();
            Ok(statement::planned_execution(statement.sql(), &batch, &name, &args))
        }
        Target::Connection => {
            let Some(next) = call.next_call.as_deref() else {
                return Ok(None);
            };
            let sql = match name.as_str() {
                "prepareStatement" | "prepareCall" => args.first().and_then(ParameterValue::render_text),
                "createStatement" => None,
                _ => return Ok(None),
            };
            let next_name = method_name(call_type_of(next)?, &next.resource_name);
            let next_args = ParameterValue::from_wire_list(&next.params)?;
            Ok(statement::planned_execution(sql.as_deref(), &[], &next_name, &next_args))
        }
        _ => Ok(None),
    }
}

/// Run a descriptor and its optional chained call. Blocking.
#[instrument(skip_all, fields(session_id = %session.id(), interface = target.interface()))]
pub fn dispatch(
    session: &Session,
    target: &Target,
    call: &CallTarget,
) -> Result<CallOutcome, ServerError> {
    let first = run_call(session, target, call)?;
    let Some(next) = call.next_call.as_deref() else {
        return Ok(first);
    };
    if next.next_call.is_some() {
        return Err(ServerError::UnsupportedOperation(
            "only one level of chained calls is supported".to_string(),
        ));
    }
    match first {
        CallOutcome::Object(intermediate) => run_call(session, &intermediate, next),
        _ => Err(ServerError::InvalidRequest(format!(
            "chained call {} needs an object result",
            method_name(call_type_of(next)?, &next.resource_name)
        ))),
    }
}

fn run_call(
    session: &Session,
    target: &Target,
    call: &CallTarget,
) -> Result<CallOutcome, ServerError> {
    let name = method_name(call_type_of(call)?, &call.resource_name);
    let args = ParameterValue::from_wire_list(&call.params)?;
    invoke_method(session, target, &name, &args)
}

fn call_type_of(call: &CallTarget) -> Result<CallType, ServerError> {
    CallType::try_from(call.call_type)
        .map_err(|_| ServerError::InvalidRequest(format!("unknown call type {}", call.call_type)))
}

// Argument and result helpers shared by the tables.

fn arg<'a>(args: &'a [ParameterValue], index: usize) -> Result<&'a ParameterValue, ServerError> {
    args.get(index)
        .ok_or_else(|| ServerError::InvalidRequest(format!("missing argument {}", index + 1)))
}

fn arg_i64(args: &[ParameterValue], index: usize) -> Result<i64, ServerError> {
    let value = arg(args, index)?;
    value.as_i64().ok_or_else(|| {
        ServerError::InvalidRequest(format!("argument {} is not an integer: {value:?}", index + 1))
    })
}

fn arg_i32(args: &[ParameterValue], index: usize) -> Result<i32, ServerError> {
    let raw = arg_i64(args, index)?;
    i32::try_from(raw)
        .map_err(|_| ServerError::InvalidRequest(format!("argument {} out of range: {raw}", index + 1)))
}

fn arg_bool(args: &[ParameterValue], index: usize) -> Result<bool, ServerError> {
    let value = arg(args, index)?;
    value.as_bool().ok_or_else(|| {
        ServerError::InvalidRequest(format!("argument {} is not a boolean: {value:?}", index + 1))
    })
}

fn arg_text(args: &[ParameterValue], index: usize) -> Result<String, ServerError> {
    let value = arg(args, index)?;
    value.render_text().ok_or_else(|| {
        ServerError::InvalidRequest(format!("argument {} must not be null", index + 1))
    })
}

/// Optional text argument; SQL NULL maps to `None`.
fn arg_opt_text(args: &[ParameterValue], index: usize) -> Result<Option<String>, ServerError> {
    Ok(arg(args, index)?.render_text())
}

fn void() -> Result<CallOutcome, ServerError> {
    Ok(CallOutcome::Void)
}

fn boolean(value: bool) -> Result<CallOutcome, ServerError> {
    Ok(CallOutcome::Value(ParameterValue::Boolean(value)))
}

fn int(value: i32) -> Result<CallOutcome, ServerError> {
    Ok(CallOutcome::Value(ParameterValue::Int(value)))
}

fn int_of(value: usize) -> Result<CallOutcome, ServerError> {
    int(i32::try_from(value).unwrap_or(i32::MAX))
}

fn long(value: i64) -> Result<CallOutcome, ServerError> {
    Ok(CallOutcome::Value(ParameterValue::Long(value)))
}

fn text(value: impl Into<String>) -> Result<CallOutcome, ServerError> {
    Ok(CallOutcome::Value(ParameterValue::Text(value.into())))
}

fn null() -> Result<CallOutcome, ServerError> {
    Ok(CallOutcome::Value(ParameterValue::Null(0)))
}

fn object(target: Target) -> Result<CallOutcome, ServerError> {
    Ok(CallOutcome::Object(target))
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;
    use crate::session::tests::session;

    fn noop(_: &Session, _: &(), _: &[ParameterValue]) -> Result<CallOutcome, ServerError> {
        void()
    }

    const TABLE: &[MethodEntry<()>] = &[method("getThing", 0, noop), method("getThing", 2, noop)];

    #[test]
    fn method_names_join_prefix_and_resource_name() {
        assert_eq!(method_name(CallType::Get, "AutoCommit"), "getAutoCommit");
        assert_eq!(method_name(CallType::Supports, "Savepoints"), "supportsSavepoints");
        assert_eq!(method_name(CallType::Call, "PrepareStatement"), "prepareStatement");
        assert_eq!(method_name(CallType::Next, ""), "next");
    }

    #[test]
    fn lookup_distinguishes_unknown_methods_from_bad_arity() -> Result<()> {
        assert!(lookup(TABLE, "Test", "getThing", 2).is_ok());
        let arity = lookup(TABLE, "Test", "getThing", 1)
            .err()
            .ok_or_else(|| anyhow!("arity mismatch resolved"))?;
        assert!(matches!(&arity, ServerError::UnsupportedOperation(m) if m.contains("[0, 2]")));
        let missing = lookup(TABLE, "Test", "getOther", 0)
            .err()
            .ok_or_else(|| anyhow!("unknown method resolved"))?;
        assert!(matches!(&missing, ServerError::UnsupportedOperation(m) if m.contains("Test.getOther")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registered_attributes_resolve_to_their_targets() -> Result<()> {
        let session = session().await?;
        let savepoint = Target::Savepoint(SavepointRef {
            id: 3,
            name: Some("before_load".to_string()),
        });
        let savepoint_id = savepoint
            .register(&session)
            .ok_or_else(|| anyhow!("savepoint not registered"))?;
        let metadata_id = Target::DatabaseMetaData
            .register(&session)
            .ok_or_else(|| anyhow!("metadata not registered"))?;

        match Target::resolve(&session, ResourceType::Savepoint, &savepoint_id)
            .map_err(|e| anyhow!(e.to_string()))?
        {
            Target::Savepoint(resolved) => assert_eq!(resolved.sql_name(), "before_load"),
            other => return Err(anyhow!("resolved to {}", other.interface())),
        }
        assert!(matches!(
            Target::resolve(&session, ResourceType::DatabaseMetaData, &metadata_id),
            Ok(Target::DatabaseMetaData)
        ));
        assert!(matches!(
            Target::resolve(&session, ResourceType::Savepoint, &ResourceId::new()),
            Err(ServerError::ResourceNotFound { .. })
        ));
        Ok(())
    }

    fn descriptor(call_type: CallType, name: &str, params: &[ParameterValue]) -> CallTarget {
        CallTarget {
            call_type: call_type as i32,
            resource_name: name.to_string(),
            params: params.iter().map(ParameterValue::to_wire).collect(),
            next_call: None,
        }
    }

    #[test]
    fn executions_are_found_without_running_the_call() -> Result<()> {
        let prepared = Target::Statement(Arc::new(StatementResource::prepared(
            "SELECT * FROM t WHERE id = ?",
        )));
        let query = execution_of(&prepared, &descriptor(CallType::Execute, "Query", &[]))
            .map_err(|e| anyhow!(e.to_string()))?
            .ok_or_else(|| anyhow!("executeQuery not recognised"))?;
        assert_eq!(query.sql, "SELECT * FROM t WHERE id = ?");
        assert_eq!(query.kind, OperationKind::Query);
        assert!(execution_of(&prepared, &descriptor(CallType::Get, "MaxRows", &[]))
            .map_err(|e| anyhow!(e.to_string()))?
            .is_none());

        let plain = Target::Statement(Arc::new(StatementResource::plain()));
        let insert = execution_of(
            &plain,
            &descriptor(CallType::Execute, "", &[ParameterValue::Text("INSERT INTO t VALUES (1)".to_string())]),
        )
        .map_err(|e| anyhow!(e.to_string()))?
        .ok_or_else(|| anyhow!("execute not recognised"))?;
        assert_eq!(insert.kind, OperationKind::Update);

        let mut chained = descriptor(
            CallType::Call,
            "PrepareStatement",
            &[ParameterValue::Text("DELETE FROM t".to_string())],
        );
        chained.next_call = Some(Box::new(descriptor(CallType::Execute, "Update", &[])));
        let delete = execution_of(&Target::Connection, &chained)
            .map_err(|e| anyhow!(e.to_string()))?
            .ok_or_else(|| anyhow!("chained executeUpdate not recognised"))?;
        assert_eq!(delete.sql, "DELETE FROM t");
        assert_eq!(delete.kind, OperationKind::Update);
        Ok(())
    }

    #[test]
    fn every_table_has_unique_name_arity_pairs() {
        fn check<T>(table: &[MethodEntry<T>]) {
            for (i, entry) in table.iter().enumerate() {
                assert!(
                    !table[i + 1..]
                        .iter()
                        .any(|other| other.name == entry.name && other.arity == entry.arity),
                    "duplicate entry {}/{}",
                    entry.name,
                    entry.arity
                );
            }
        }
        check(connection::METHODS);
        check(statement::METHODS);
        check(result_set::METHODS);
        check(metadata::RESULT_SET_METADATA);
        check(metadata::PARAMETER_METADATA);
        check(metadata::DATABASE_METADATA);
        check(metadata::SAVEPOINT);
        check(lob::METHODS);
    }
}
