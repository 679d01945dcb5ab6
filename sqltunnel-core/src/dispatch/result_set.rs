use std::sync::Arc;

use chrono::NaiveTime;
use duckdb::arrow::array::Array;

use crate::engine::cells::{decode_cell, is_binary, Cell};
use crate::error::ServerError;
use crate::lob::LobResource;
use crate::session::{CursorMotion, ResultSetResource, Session};
use crate::value::ParameterValue;

use super::{
    arg, arg_i64, arg_text, boolean, int, int_of, method, null, object, void, CallOutcome,
    MethodEntry, Target,
};

type Args<'a> = &'a [ParameterValue];
type Outcome = Result<CallOutcome, ServerError>;
type Rs = ResultSetResource;

/// `ResultSet.TYPE_SCROLL_INSENSITIVE`.
const TYPE_SCROLL_INSENSITIVE: i32 = 1004;
/// `ResultSet.CONCUR_READ_ONLY`.
const CONCUR_READ_ONLY: i32 = 1007;
/// `ResultSet.FETCH_FORWARD`.
const FETCH_FORWARD: i32 = 1000;

/// `java.sql.ResultSet`.
pub(super) const METHODS: &[MethodEntry<ResultSetResource>] = &[
    method("next", 0, next),
    method("previous", 0, previous),
    method("first", 0, first),
    method("last", 0, last),
    method("beforeFirst", 0, before_first),
    method("afterLast", 0, after_last),
    method("absolute", 1, absolute),
    method("relative", 1, relative),
    method("isBeforeFirst", 0, is_before_first),
    method("isAfterLast", 0, is_after_last),
    method("isFirst", 0, is_first),
    method("isLast", 0, is_last),
    method("getRow", 0, get_row),
    method("getString", 1, get_string),
    method("getNString", 1, get_string),
    method("getBoolean", 1, get_boolean),
    method("getByte", 1, get_byte),
    method("getShort", 1, get_int),
    method("getInt", 1, get_int),
    method("getLong", 1, get_long),
    method("getFloat", 1, get_float),
    method("getDouble", 1, get_double),
    method("getBigDecimal", 1, get_big_decimal),
    method("getBytes", 1, get_bytes),
    method("getDate", 1, get_date),
    method("getTime", 1, get_time),
    method("getTimestamp", 1, get_timestamp),
    method("getObject", 1, get_object),
    method("getBlob", 1, get_blob),
    method("getBinaryStream", 1, get_blob),
    method("getClob", 1, get_clob),
    method("getNClob", 1, get_clob),
    method("wasNull", 0, was_null),
    method("findColumn", 1, find_column),
    method("getMetaData", 0, get_meta_data),
    method("getFetchSize", 0, get_fetch_size),
    method("setFetchSize", 1, set_fetch_size),
    method("getFetchDirection", 0, get_fetch_direction),
    method("getType", 0, get_type),
    method("getConcurrency", 0, get_concurrency),
    method("getHoldability", 0, get_holdability),
    method("getStatement", 0, get_statement),
    method("isClosed", 0, is_closed),
    method("close", 0, close),
    method("getWarnings", 0, get_warnings),
    method("clearWarnings", 0, clear_warnings),
];

fn scroll(result_set: &Rs, motion: CursorMotion) -> Outcome {
    boolean(result_set.scroll(motion)?)
}

fn next(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    scroll(result_set, CursorMotion::Next)
}

fn previous(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    scroll(result_set, CursorMotion::Previous)
}

fn first(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    scroll(result_set, CursorMotion::First)
}

fn last(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    scroll(result_set, CursorMotion::Last)
}

fn before_first(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    result_set.scroll(CursorMotion::BeforeFirst)?;
    void()
}

fn after_last(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    result_set.scroll(CursorMotion::AfterLast)?;
    void()
}

fn absolute(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    scroll(result_set, CursorMotion::Absolute(arg_i64(args, 0)?))
}

fn relative(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    scroll(result_set, CursorMotion::Relative(arg_i64(args, 0)?))
}

fn is_before_first(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    boolean(result_set.position_flags().before_first)
}

fn is_after_last(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    boolean(result_set.position_flags().after_last)
}

fn is_first(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    boolean(result_set.position_flags().first)
}

fn is_last(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    boolean(result_set.position_flags().last)
}

fn get_row(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    int_of(result_set.row_number())
}

/// Zero-based column named by a one-based index or a label.
fn column_index(result_set: &Rs, args: Args) -> Result<usize, ServerError> {
    let column = arg(args, 0)?;
    let one_based = match column {
        ParameterValue::Text(label) => result_set.metadata().find_column(label)?,
        other => {
            let index = other.as_i64().ok_or_else(|| {
                ServerError::InvalidRequest(format!("invalid column reference {other:?}"))
            })?;
            result_set.metadata().column(index)?;
            index as usize
        }
    };
    Ok(one_based - 1)
}

/// Cell under the cursor; records `wasNull`.
fn current_cell(result_set: &Rs, args: Args) -> Result<Cell, ServerError> {
    let column = column_index(result_set, args)?;
    let row = result_set.current_row()?;
    let (array, local_row) = result_set.cell(row, column)?;
    let cell = decode_cell(&array, local_row)?;
    result_set.set_was_null(matches!(&cell, Cell::Value(value) if value.is_null()));
    Ok(cell)
}

fn conversion_error(target: &str, value: &ParameterValue) -> ServerError {
    ServerError::InvalidRequest(format!("cannot read {value:?} as {target}"))
}

/// Read the current cell and convert it; SQL NULL passes through unchanged.
fn read_as(
    result_set: &Rs,
    args: Args,
    target: &str,
    convert: impl FnOnce(ParameterValue) -> Option<ParameterValue>,
) -> Outcome {
    let value = match current_cell(result_set, args)? {
        Cell::Value(value) if value.is_null() => return Ok(CallOutcome::Value(value)),
        Cell::Value(value) => value,
        Cell::Binary(bytes) => ParameterValue::Bytes(bytes),
    };
    let described = format!("{value:?}");
    match convert(value) {
        Some(converted) => Ok(CallOutcome::Value(converted)),
        None => Err(ServerError::InvalidRequest(format!(
            "cannot read {described} as {target}"
        ))),
    }
}

fn integral(value: &ParameterValue) -> Option<i64> {
    match value {
        ParameterValue::Boolean(v) => Some(i64::from(*v)),
        other => other.as_i64().or_else(|| other.as_f64().map(|f| f.trunc() as i64)),
    }
}

fn get_string(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "string", |value| {
        value.render_text().map(ParameterValue::Text)
    })
}

fn get_boolean(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "boolean", |value| {
        let flag = match &value {
            ParameterValue::Text(text) => match text.trim() {
                "1" => Some(true),
                "0" => Some(false),
                other => other.to_ascii_lowercase().parse().ok(),
            },
            other => other.as_bool().or_else(|| integral(other).map(|v| v != 0)),
        };
        flag.map(ParameterValue::Boolean)
    })
}

fn get_byte(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "byte", |value| {
        integral(&value)
            .and_then(|v| i8::try_from(v).ok())
            .map(ParameterValue::Byte)
    })
}

fn get_int(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "int", |value| {
        integral(&value)
            .and_then(|v| i32::try_from(v).ok())
            .map(ParameterValue::Int)
    })
}

fn get_long(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "long", |value| {
        integral(&value).map(ParameterValue::Long)
    })
}

fn get_float(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "float", |value| {
        value.as_f64().map(|v| ParameterValue::Float(v as f32))
    })
}

fn get_double(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "double", |value| {
        value.as_f64().map(ParameterValue::Double)
    })
}

fn get_big_decimal(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "decimal", |value| match value {
        ParameterValue::Decimal(_) => Some(value),
        ParameterValue::Bytes(_) | ParameterValue::Boolean(_) => None,
        other => other
            .as_f64()
            .and_then(|_| other.render_text())
            .map(ParameterValue::Decimal),
    })
}

fn get_bytes(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "bytes", |value| match value {
        ParameterValue::Bytes(_) => Some(value),
        ParameterValue::Text(text) => Some(ParameterValue::Bytes(text.into_bytes())),
        _ => None,
    })
}

fn get_date(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "date", |value| match value {
        ParameterValue::Date(_) => Some(value),
        ParameterValue::Timestamp(ts) => Some(ParameterValue::Date(ts.date())),
        _ => None,
    })
}

fn get_time(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "time", |value| match value {
        ParameterValue::Time(_) => Some(value),
        ParameterValue::Timestamp(ts) => Some(ParameterValue::Time(ts.time())),
        _ => None,
    })
}

fn get_timestamp(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "timestamp", |value| match value {
        ParameterValue::Timestamp(_) => Some(value),
        ParameterValue::Date(date) => Some(ParameterValue::Timestamp(
            date.and_time(NaiveTime::MIN),
        )),
        _ => None,
    })
}

fn get_object(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    read_as(result_set, args, "object", Some)
}

/// Binary cell as a Blob. Drivers that lose LOB data on cursor movement get
/// an eager copy; others read the materialised cell in place.
fn get_blob(session: &Session, result_set: &Rs, args: Args) -> Outcome {
    let column = column_index(result_set, args)?;
    let row = result_set.current_row()?;
    let (array, local_row) = result_set.cell(row, column)?;
    if array.is_null(local_row) {
        result_set.set_was_null(true);
        return null();
    }
    result_set.set_was_null(false);
    let lob = if !is_binary(array.data_type()) {
        match decode_cell(&array, local_row)? {
            Cell::Value(value) => match value.render_text() {
                Some(text) => LobResource::from_bytes(text.into_bytes()),
                None => return null(),
            },
            Cell::Binary(bytes) => LobResource::from_bytes(bytes),
        }
    } else if session.capabilities().requires_eager_lob_hydration {
        match decode_cell(&array, local_row)? {
            Cell::Binary(bytes) => LobResource::from_bytes(bytes),
            Cell::Value(value) => return Err(conversion_error("blob", &value)),
        }
    } else {
        let lob = Arc::new(LobResource::from_cell(array, local_row));
        session
            .resources()
            .register_result_lob(result_set.id(), lob.clone());
        return object(Target::Lob(lob));
    };
    register_lob(session, lob)
}

fn get_clob(session: &Session, result_set: &Rs, args: Args) -> Outcome {
    let text = match current_cell(result_set, args)? {
        Cell::Value(value) if value.is_null() => return null(),
        Cell::Value(value) => value
            .render_text()
            .ok_or_else(|| conversion_error("clob", &value))?,
        Cell::Binary(bytes) => String::from_utf8(bytes).map_err(|err| {
            ServerError::InvalidRequest(format!("binary cell is not valid UTF-8: {err}"))
        })?,
    };
    register_lob(session, LobResource::from_text(text))
}

fn register_lob(session: &Session, lob: LobResource) -> Outcome {
    let lob = Arc::new(lob);
    session.resources().register_lob(lob.clone());
    object(Target::Lob(lob))
}

fn was_null(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    boolean(result_set.was_null())
}

fn find_column(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    int_of(result_set.metadata().find_column(&arg_text(args, 0)?)?)
}

/// Served from the snapshot taken at execution time, so it stays readable
/// after the cursor moves or the result set closes.
fn get_meta_data(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    object(Target::ResultSetMetaData(result_set.describe()?))
}

fn get_fetch_size(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    int(result_set.fetch_size())
}

fn set_fetch_size(_: &Session, result_set: &Rs, args: Args) -> Outcome {
    let size = super::arg_i32(args, 0)?;
    result_set.set_fetch_size(size)?;
    void()
}

fn get_fetch_direction(_: &Session, _: &Rs, _: Args) -> Outcome {
    int(FETCH_FORWARD)
}

fn get_type(_: &Session, _: &Rs, _: Args) -> Outcome {
    int(TYPE_SCROLL_INSENSITIVE)
}

fn get_concurrency(_: &Session, _: &Rs, _: Args) -> Outcome {
    int(CONCUR_READ_ONLY)
}

fn get_holdability(session: &Session, _: &Rs, _: Args) -> Outcome {
    int(session.connection_state().holdability)
}

fn get_statement(session: &Session, result_set: &Rs, _: Args) -> Outcome {
    match result_set.statement() {
        Some(id) => object(Target::Statement(session.resources().statement(&id)?)),
        None => null(),
    }
}

fn is_closed(_: &Session, result_set: &Rs, _: Args) -> Outcome {
    boolean(result_set.is_closed())
}

fn close(session: &Session, result_set: &Rs, _: Args) -> Outcome {
    result_set.close();
    session.resources().remove_result_set(&result_set.id());
    void()
}

fn get_warnings(_: &Session, _: &Rs, _: Args) -> Outcome {
    null()
}

fn clear_warnings(_: &Session, _: &Rs, _: Args) -> Outcome {
    void()
}
