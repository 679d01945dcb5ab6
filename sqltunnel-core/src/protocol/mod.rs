//! Protobuf wire protocol and the action names that route it.

mod messages;

pub use messages::*;

use prost::Message;

use crate::error::ServerError;

pub const ACTION_CONNECT: &str = "connect";
pub const ACTION_EXECUTE_UPDATE: &str = "execute_update";
pub const ACTION_EXECUTE_QUERY: &str = "execute_query";
pub const ACTION_FETCH_NEXT_ROWS: &str = "fetch_next_rows";
pub const ACTION_TERMINATE_SESSION: &str = "terminate_session";
pub const ACTION_START_TRANSACTION: &str = "start_transaction";
pub const ACTION_COMMIT_TRANSACTION: &str = "commit_transaction";
pub const ACTION_ROLLBACK_TRANSACTION: &str = "rollback_transaction";
pub const ACTION_CALL_RESOURCE: &str = "call_resource";

/// Every unary action with a short description, in advertisement order.
pub const ACTIONS: &[(&str, &str)] = &[
    (ACTION_CONNECT, "Register a data source and return a session shell"),
    (ACTION_EXECUTE_UPDATE, "Execute DDL or DML and return the update count"),
    (ACTION_EXECUTE_QUERY, "Execute a query and return the first row block"),
    (ACTION_FETCH_NEXT_ROWS, "Return the next row block of a result set"),
    (ACTION_TERMINATE_SESSION, "Release a session and everything it owns"),
    (ACTION_START_TRANSACTION, "Begin a transaction on the session connection"),
    (ACTION_COMMIT_TRANSACTION, "Commit the session transaction"),
    (ACTION_ROLLBACK_TRANSACTION, "Roll back the session transaction"),
    (ACTION_CALL_RESOURCE, "Invoke a driver interface method on a registered resource"),
];

/// Decode a protobuf payload, surfacing malformed input as an invalid request.
pub fn decode<M: Message + Default>(payload: &[u8]) -> Result<M, ServerError> {
    M::decode(payload).map_err(|err| ServerError::InvalidRequest(format!("malformed payload: {err}")))
}

impl SessionInfo {
    /// True when the shell names a live server-side session.
    pub fn has_session(&self) -> bool {
        !self.session_uuid.is_empty()
    }
}

impl WireValue {
    pub fn of(kind: wire_value::Kind) -> Self {
        Self { kind: Some(kind) }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn chained_call_target_survives_encoding() -> Result<()> {
        let request = CallResourceRequest {
            session: Some(SessionInfo {
                session_uuid: "s-1".to_string(),
                ..SessionInfo::default()
            }),
            resource_type: ResourceType::ResultSet as i32,
            resource_uuid: "rs-1".to_string(),
            target: Some(CallTarget {
                call_type: CallType::Get as i32,
                resource_name: "MetaData".to_string(),
                params: vec![],
                next_call: Some(Box::new(CallTarget {
                    call_type: CallType::Get as i32,
                    resource_name: "ColumnCount".to_string(),
                    params: vec![],
                    next_call: None,
                })),
            }),
            ..CallResourceRequest::default()
        };

        let decoded: CallResourceRequest = decode(&request.encode_to_vec())?;
        assert_eq!(decoded.resource_type(), ResourceType::ResultSet);
        let next = decoded
            .target
            .and_then(|target| target.next_call)
            .map(|next| next.resource_name);
        assert_eq!(next.as_deref(), Some("ColumnCount"));
        Ok(())
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode::<StatementRequest>(&[0xff, 0xff, 0xff]);
        assert!(matches!(err, Err(ServerError::InvalidRequest(_))));
    }

    #[test]
    fn call_type_prefix_builds_method_names() {
        assert_eq!(format!("{}{}", CallType::Get.prefix(), "AutoCommit"), "getAutoCommit");
        assert_eq!(CallType::Call.prefix(), "");
        assert_eq!(CallType::BeforeFirst.prefix(), "beforeFirst");
    }
}
