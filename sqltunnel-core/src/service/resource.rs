use std::time::Instant;

use tracing::{debug, instrument, Span};

use super::{blocking, wait_for_lobs, ProtocolService};
use crate::dispatch::{dispatch, execution_of, CallOutcome, Target};
use crate::error::ServerError;
use crate::fingerprint::OperationFingerprint;
use crate::protocol::{CallResourceRequest, CallResourceResponse, ResourceType, WireValue};
use crate::session::{ResourceId, Session, StatementResource};
use crate::value::ParameterValue;

impl ProtocolService {
    /// Run a call descriptor, and its chained call, against a session
    /// resource. Connection and statement calls without a resource id create
    /// the resource first and report its id back. Calls that execute SQL pass
    /// the circuit breaker and are recorded by the monitor like direct
    /// statements. A session created for a call that fails is released.
    #[instrument(
        skip(self, request),
        fields(session_id, resource_type = ?request.resource_type(), resource_id = %request.resource_uuid, fingerprint)
    )]
    pub async fn call_resource(
        &self,
        request: CallResourceRequest,
    ) -> Result<CallResourceResponse, ServerError> {
        let call = request.target.clone().ok_or_else(|| {
            ServerError::InvalidRequest("call descriptor without a target".to_string())
        })?;
        let resource_type = ResourceType::try_from(request.resource_type).map_err(|_| {
            ServerError::InvalidRequest(format!("unknown resource type {}", request.resource_type))
        })?;
        let shell = request.session.clone().unwrap_or_default();
        let resource_id = if request.resource_uuid.is_empty() {
            None
        } else {
            Some(ResourceId::parse(&request.resource_uuid)?)
        };
        if resource_id.is_none() {
            check_creatable(resource_type, &request.sql)?;
        }
        let claim = self.stateful_session(&shell).await?;
        let session = claim.session().clone();
        Span::current().record("session_id", session.id().as_ref());
        session.touch();

        let (target, created) = match &resource_id {
            None => create_target(&session, resource_type, &request.sql)?,
            Some(id) => (Target::resolve(&session, resource_type, id)?, None),
        };
        let execution = execution_of(&target, &call)?;

        let mut pending = ParameterValue::from_wire_list(&call.params)?;
        if let Some(next) = &call.next_call {
            pending.extend(ParameterValue::from_wire_list(&next.params)?);
        }
        if let (Some(_), Target::Statement(statement)) = (&execution, &target) {
            pending.extend(statement.state().parameters.values().cloned());
        }

        let guarded = match &execution {
            Some(execution) => {
                let guard = self.guard(OperationFingerprint::of_sql(&execution.sql))?;
                Span::current().record("fingerprint", tracing::field::display(guard.fingerprint()));
                Some((guard, self.monitor.start(execution.kind)))
            }
            None => None,
        };
        wait_for_lobs(&session, &pending).await?;

        let worker = session.clone();
        let started = Instant::now();
        let result = blocking(move || {
            let outcome = dispatch(&worker, &target, &call)?;
            Ok(encode_outcome(&worker, outcome))
        })
        .await;
        match (guarded, &execution) {
            (Some((guard, _in_flight)), Some(execution)) => {
                self.observe(guard.fingerprint(), &execution.sql, execution.kind, started, &result, |_| None);
                guard.settle(&result);
            }
            _ => {
                if let Err(err) = &result {
                    self.monitor.record_error("call_resource", err.to_string());
                }
            }
        }
        let (values, result_uuid) = self.settle(&session, result)?;
        let session = claim.keep();
        debug!(values = values.len(), result_uuid = %result_uuid, "call completed");

        Ok(CallResourceResponse {
            session: Some(session.info()),
            resource_uuid: created
                .map(|id| id.to_string())
                .unwrap_or(request.resource_uuid),
            result_uuid,
            values,
        })
    }
}

/// Reject a descriptor without an id that names nothing creatable, before
/// any connection is taken for it.
fn check_creatable(resource_type: ResourceType, sql: &str) -> Result<(), ServerError> {
    match resource_type {
        ResourceType::Connection | ResourceType::Statement => Ok(()),
        ResourceType::PreparedStatement | ResourceType::CallableStatement => {
            required_sql(sql).map(|_| ())
        }
        other => Err(ServerError::InvalidRequest(format!(
            "{other:?} calls need a resource id"
        ))),
    }
}

/// Create the resource a descriptor without an id refers to.
fn create_target(
    session: &Session,
    resource_type: ResourceType,
    sql: &str,
) -> Result<(Target, Option<ResourceId>), ServerError> {
    let statement = match resource_type {
        ResourceType::Connection => return Ok((Target::Connection, None)),
        ResourceType::Statement => StatementResource::plain(),
        ResourceType::PreparedStatement => StatementResource::prepared(required_sql(sql)?),
        ResourceType::CallableStatement => StatementResource::callable(required_sql(sql)?),
        other => {
            return Err(ServerError::InvalidRequest(format!(
                "{other:?} calls need a resource id"
            )))
        }
    };
    let statement = session.resources().register_statement(statement);
    debug!(statement_id = %statement.id(), ?resource_type, "created statement for call");
    let id = statement.id();
    Ok((Target::Statement(statement), Some(id)))
}

fn required_sql(sql: &str) -> Result<&str, ServerError> {
    if sql.trim().is_empty() {
        return Err(ServerError::InvalidRequest(
            "prepared and callable statements need SQL".to_string(),
        ));
    }
    Ok(sql)
}

/// Values go back inline; objects are registered and returned by id.
fn encode_outcome(session: &Session, outcome: CallOutcome) -> (Vec<WireValue>, String) {
    match outcome {
        CallOutcome::Void => (Vec::new(), String::new()),
        CallOutcome::Value(value) => (vec![value.to_wire()], String::new()),
        CallOutcome::Values(values) => (values.iter().map(ParameterValue::to_wire).collect(), String::new()),
        CallOutcome::Object(target) => (
            Vec::new(),
            target
                .register(session)
                .map(|id| id.to_string())
                .unwrap_or_default(),
        ),
    }
}
