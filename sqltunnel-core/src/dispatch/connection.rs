use crate::engine::quote_identifier;
use crate::error::ServerError;
use crate::lob::LobResource;
use crate::protocol::LobType;
use crate::session::{
    Attribute, ResourceId, Session, StatementResource, CLOSE_CURSORS_AT_COMMIT,
    TRANSACTION_SERIALIZABLE,
};
use crate::value::ParameterValue;

use super::{
    arg_bool, arg_i32, arg_opt_text, arg_text, boolean, int, method, null, object, text, void,
    CallOutcome, MethodEntry, SavepointRef, Target,
};

type Args<'a> = &'a [ParameterValue];
type Outcome = Result<CallOutcome, ServerError>;

/// `java.sql.Connection`.
pub(super) const METHODS: &[MethodEntry<()>] = &[
    method("getAutoCommit", 0, get_auto_commit),
    method("setAutoCommit", 1, set_auto_commit),
    method("commit", 0, commit),
    method("rollback", 0, rollback),
    method("rollback", 1, rollback_to_savepoint),
    method("setSavepoint", 0, set_savepoint),
    method("setSavepoint", 1, set_savepoint),
    method("releaseSavepoint", 1, release_savepoint),
    method("isClosed", 0, is_closed),
    method("isValid", 1, is_valid),
    method("isReadOnly", 0, is_read_only),
    method("setReadOnly", 1, set_read_only),
    method("getTransactionIsolation", 0, get_transaction_isolation),
    method("setTransactionIsolation", 1, set_transaction_isolation),
    method("getHoldability", 0, get_holdability),
    method("setHoldability", 1, set_holdability),
    method("getNetworkTimeout", 0, get_network_timeout),
    method("setNetworkTimeout", 1, set_network_timeout),
    method("getCatalog", 0, get_catalog),
    method("setCatalog", 1, set_catalog),
    method("getSchema", 0, get_schema),
    method("setSchema", 1, set_schema),
    method("getClientInfo", 1, get_client_info),
    method("setClientInfo", 2, set_client_info),
    method("getMetaData", 0, get_meta_data),
    method("createStatement", 0, create_statement),
    method("prepareStatement", 1, prepare_statement),
    method("prepareCall", 1, prepare_call),
    method("nativeSQL", 1, native_sql),
    method("createBlob", 0, create_blob),
    method("createClob", 0, create_clob),
    method("getWarnings", 0, get_warnings),
    method("clearWarnings", 0, clear_warnings),
];

fn get_auto_commit(session: &Session, _: &(), _: Args) -> Outcome {
    boolean(session.auto_commit())
}

fn set_auto_commit(session: &Session, _: &(), args: Args) -> Outcome {
    session.set_auto_commit(arg_bool(args, 0)?)?;
    void()
}

/// Commit in auto-commit mode has nothing to do.
fn commit(session: &Session, _: &(), _: Args) -> Outcome {
    if session.transaction_id().is_some() {
        session.commit_transaction()?;
    }
    void()
}

fn rollback(session: &Session, _: &(), _: Args) -> Outcome {
    if session.transaction_id().is_some() {
        session.rollback_transaction()?;
    }
    void()
}

fn savepoint_arg(session: &Session, args: Args) -> Result<(ResourceId, SavepointRef), ServerError> {
    let id = ResourceId::parse(&arg_text(args, 0)?)?;
    match session.resources().attribute(&id)?.as_ref() {
        Attribute::Savepoint { id: number, name } => Ok((
            id,
            SavepointRef {
                id: *number,
                name: name.clone(),
            },
        )),
        _ => Err(ServerError::InvalidRequest(format!("{id} is not a savepoint"))),
    }
}

fn rollback_to_savepoint(session: &Session, _: &(), args: Args) -> Outcome {
    let (_, savepoint) = savepoint_arg(session, args)?;
    let sql = format!(
        "ROLLBACK TO SAVEPOINT {}",
        quote_identifier(&savepoint.sql_name())
    );
    session.run(|conn| conn.execute_batch(&sql))?;
    void()
}

fn set_savepoint(session: &Session, _: &(), args: Args) -> Outcome {
    let name = match args.first() {
        Some(value) => value.render_text(),
        None => None,
    };
    session.begin_transaction()?;
    let id = {
        let mut state = session.connection_state();
        let id = state.next_savepoint;
        state.next_savepoint += 1;
        id
    };
    let savepoint = SavepointRef { id, name };
    let sql = format!("SAVEPOINT {}", quote_identifier(&savepoint.sql_name()));
    session.run(|conn| conn.execute_batch(&sql))?;
    object(Target::Savepoint(savepoint))
}

fn release_savepoint(session: &Session, _: &(), args: Args) -> Outcome {
    let (id, savepoint) = savepoint_arg(session, args)?;
    let sql = format!("RELEASE SAVEPOINT {}", quote_identifier(&savepoint.sql_name()));
    session.run(|conn| conn.execute_batch(&sql))?;
    session.resources().remove_attribute(&id);
    void()
}

fn is_closed(session: &Session, _: &(), _: Args) -> Outcome {
    boolean(session.is_closed())
}

fn is_valid(session: &Session, _: &(), _: Args) -> Outcome {
    boolean(session.run(|conn| conn.execute_batch("SELECT 1")).is_ok())
}

fn is_read_only(session: &Session, _: &(), _: Args) -> Outcome {
    boolean(session.connection_state().read_only)
}

/// Recorded only; DuckDB cannot switch a shared database to read-only per connection.
fn set_read_only(session: &Session, _: &(), args: Args) -> Outcome {
    session.connection_state().read_only = arg_bool(args, 0)?;
    void()
}

fn get_transaction_isolation(session: &Session, _: &(), _: Args) -> Outcome {
    int(session.connection_state().transaction_isolation)
}

/// Every requested level is served as serializable, the engine's only level.
fn set_transaction_isolation(session: &Session, _: &(), args: Args) -> Outcome {
    let level = arg_i32(args, 0)?;
    if level == 0 {
        return Err(ServerError::UnsupportedOperation(
            "TRANSACTION_NONE is not supported".to_string(),
        ));
    }
    session.connection_state().transaction_isolation = TRANSACTION_SERIALIZABLE;
    void()
}

fn get_holdability(session: &Session, _: &(), _: Args) -> Outcome {
    int(session.connection_state().holdability)
}

fn set_holdability(session: &Session, _: &(), args: Args) -> Outcome {
    let holdability = arg_i32(args, 0)?;
    if holdability != CLOSE_CURSORS_AT_COMMIT && holdability != 1 {
        return Err(ServerError::InvalidRequest(format!(
            "unknown holdability {holdability}"
        )));
    }
    session.connection_state().holdability = holdability;
    void()
}

fn get_network_timeout(session: &Session, _: &(), _: Args) -> Outcome {
    int(session.connection_state().network_timeout_ms)
}

fn set_network_timeout(session: &Session, _: &(), args: Args) -> Outcome {
    let timeout = arg_i32(args, 0)?;
    if timeout < 0 {
        return Err(ServerError::InvalidRequest(format!(
            "negative network timeout {timeout}"
        )));
    }
    session.connection_state().network_timeout_ms = timeout;
    void()
}

fn get_catalog(session: &Session, _: &(), _: Args) -> Outcome {
    text(session.run(|conn| conn.current_catalog())?)
}

fn set_catalog(session: &Session, _: &(), args: Args) -> Outcome {
    let catalog = arg_text(args, 0)?;
    session.run(|conn| conn.use_target(&catalog))?;
    void()
}

fn get_schema(session: &Session, _: &(), _: Args) -> Outcome {
    text(session.run(|conn| conn.current_schema())?)
}

fn set_schema(session: &Session, _: &(), args: Args) -> Outcome {
    let schema = arg_text(args, 0)?;
    session.run(|conn| conn.use_target(&schema))?;
    void()
}

fn get_client_info(session: &Session, _: &(), args: Args) -> Outcome {
    let key = arg_text(args, 0)?;
    match session.connection_state().client_info.get(&key) {
        Some(value) => text(value.clone()),
        None => null(),
    }
}

fn set_client_info(session: &Session, _: &(), args: Args) -> Outcome {
    let key = arg_text(args, 0)?;
    let mut state = session.connection_state();
    match arg_opt_text(args, 1)? {
        Some(value) => state.client_info.insert(key, value),
        None => state.client_info.remove(&key),
    };
    void()
}

fn get_meta_data(_: &Session, _: &(), _: Args) -> Outcome {
    object(Target::DatabaseMetaData)
}

fn create_statement(session: &Session, _: &(), _: Args) -> Outcome {
    let statement = session
        .resources()
        .register_statement(StatementResource::plain());
    object(Target::Statement(statement))
}

fn prepare_statement(session: &Session, _: &(), args: Args) -> Outcome {
    let sql = arg_text(args, 0)?;
    let statement = session
        .resources()
        .register_statement(StatementResource::prepared(sql));
    object(Target::Statement(statement))
}

fn prepare_call(session: &Session, _: &(), args: Args) -> Outcome {
    let sql = arg_text(args, 0)?;
    let statement = session
        .resources()
        .register_statement(StatementResource::callable(sql));
    object(Target::Statement(statement))
}

fn native_sql(_: &Session, _: &(), args: Args) -> Outcome {
    text(arg_text(args, 0)?)
}

fn create_blob(session: &Session, _: &(), _: Args) -> Outcome {
    create_lob(session, LobType::Blob)
}

fn create_clob(session: &Session, _: &(), _: Args) -> Outcome {
    create_lob(session, LobType::Clob)
}

fn create_lob(session: &Session, lob_type: LobType) -> Outcome {
    let lob = std::sync::Arc::new(LobResource::empty(lob_type));
    session.resources().register_lob(lob.clone());
    object(Target::Lob(lob))
}

fn get_warnings(_: &Session, _: &(), _: Args) -> Outcome {
    null()
}

fn clear_warnings(_: &Session, _: &(), _: Args) -> Outcome {
    void()
}
