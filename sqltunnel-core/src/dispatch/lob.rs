use crate::error::ServerError;
use crate::lob::LobResource;
use crate::session::Session;
use crate::value::ParameterValue;

use super::{arg, arg_i64, arg_text, int_of, long, method, void, CallOutcome, MethodEntry};

type Args<'a> = &'a [ParameterValue];
type Outcome = Result<CallOutcome, ServerError>;

/// `java.sql.Blob` / `java.sql.Clob`. Positions are one-based; Clob
/// positions and lengths count characters.
pub(super) const METHODS: &[MethodEntry<LobResource>] = &[
    method("length", 0, length),
    method("getBytes", 2, get_bytes),
    method("getSubString", 2, get_sub_string),
    method("setBytes", 2, set_bytes),
    method("setString", 2, set_string),
    method("truncate", 1, truncate),
    method("free", 0, free),
];

fn position(args: Args) -> Result<i64, ServerError> {
    let position = arg_i64(args, 0)?;
    if position < 1 {
        return Err(ServerError::InvalidRequest(format!(
            "lob position {position} must be at least 1"
        )));
    }
    Ok(position)
}

fn length(_: &Session, lob: &LobResource, _: Args) -> Outcome {
    let len = lob.length().ok_or_else(|| {
        ServerError::UnsupportedOperation(format!("length of streamed lob {}", lob.id()))
    })?;
    long(i64::try_from(len).unwrap_or(i64::MAX))
}

fn get_bytes(_: &Session, lob: &LobResource, args: Args) -> Outcome {
    let bytes = lob.read_range(position(args)?, arg_i64(args, 1)?)?;
    Ok(CallOutcome::Value(ParameterValue::Bytes(bytes)))
}

fn get_sub_string(_: &Session, lob: &LobResource, args: Args) -> Outcome {
    let bytes = lob.read_range(position(args)?, arg_i64(args, 1)?)?;
    let text = String::from_utf8(bytes).map_err(|err| {
        ServerError::InvalidRequest(format!("lob {} is not character data: {err}", lob.id()))
    })?;
    Ok(CallOutcome::Value(ParameterValue::Text(text)))
}

fn set_bytes(_: &Session, lob: &LobResource, args: Args) -> Outcome {
    let data = match arg(args, 1)? {
        ParameterValue::Bytes(bytes) => bytes.clone(),
        other => {
            return Err(ServerError::InvalidRequest(format!(
                "setBytes expects bytes, got {other:?}"
            )))
        }
    };
    lob.write_block(position(args)?, &data)?;
    int_of(data.len())
}

fn set_string(_: &Session, lob: &LobResource, args: Args) -> Outcome {
    let text = arg_text(args, 1)?;
    lob.write_block(position(args)?, text.as_bytes())?;
    int_of(text.chars().count())
}

fn truncate(_: &Session, lob: &LobResource, args: Args) -> Outcome {
    let len = u64::try_from(arg_i64(args, 0)?).map_err(|_| {
        ServerError::InvalidRequest("lob truncate length must not be negative".to_string())
    })?;
    lob.truncate(len)?;
    void()
}

fn free(session: &Session, lob: &LobResource, _: Args) -> Outcome {
    session.resources().remove_lob(&lob.id());
    void()
}
