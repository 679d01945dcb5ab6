//! Arrow Flight transport for the protocol service.
//!
//! Unary calls travel as `DoAction` with a protobuf body, `readLob` as
//! `DoGet` with an encoded `ReadLobRequest` ticket and `createLob` as
//! `DoExchange` carrying one protobuf message per `FlightData` body.

use arrow_flight::flight_service_server::FlightService;
use arrow_flight::{
    Action, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, SchemaResult, Ticket,
};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use prost::bytes::Bytes;
use prost::Message;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, error, instrument, warn};

use super::ProtocolService;
use crate::error::ServerError;
use crate::protocol::{
    decode, ErrorKind, LobDataBlock, ReadLobRequest, SessionInfo, ACTIONS, ACTION_CALL_RESOURCE,
    ACTION_COMMIT_TRANSACTION, ACTION_CONNECT, ACTION_EXECUTE_QUERY, ACTION_EXECUTE_UPDATE,
    ACTION_FETCH_NEXT_ROWS, ACTION_ROLLBACK_TRANSACTION, ACTION_START_TRANSACTION,
    ACTION_TERMINATE_SESSION,
};

type FlightStream<T> = BoxStream<'static, Result<T, Status>>;

#[derive(Clone)]
pub struct TunnelFlightService {
    protocol: ProtocolService,
}

impl TunnelFlightService {
    pub fn new(protocol: ProtocolService) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> &ProtocolService {
        &self.protocol
    }

    /// Decode an action body, run it and encode the single reply.
    async fn run_action(&self, action: &Action) -> Result<Bytes, ServerError> {
        let body = action.body.as_ref();
        let service = &self.protocol;
        let reply = match action.r#type.as_str() {
            ACTION_CONNECT => service.connect(decode(body)?).await?.encode_to_vec(),
            ACTION_EXECUTE_UPDATE => service.execute_update(decode(body)?).await?.encode_to_vec(),
            ACTION_EXECUTE_QUERY => service.execute_query(decode(body)?).await?.encode_to_vec(),
            ACTION_FETCH_NEXT_ROWS => service.fetch_next_rows(decode(body)?).await?.encode_to_vec(),
            ACTION_TERMINATE_SESSION => service
                .terminate_session(&decode::<SessionInfo>(body)?)
                .encode_to_vec(),
            ACTION_START_TRANSACTION => service
                .start_transaction(decode(body)?)
                .await?
                .encode_to_vec(),
            ACTION_COMMIT_TRANSACTION => service
                .commit_transaction(decode(body)?)
                .await?
                .encode_to_vec(),
            ACTION_ROLLBACK_TRANSACTION => service
                .rollback_transaction(decode(body)?)
                .await?
                .encode_to_vec(),
            ACTION_CALL_RESOURCE => service.call_resource(decode(body)?).await?.encode_to_vec(),
            other => {
                return Err(ServerError::UnsupportedOperation(format!(
                    "unknown action type {other:?}"
                )))
            }
        };
        Ok(Bytes::from(reply))
    }

    /// `createLob` over any stream of inbound frames.
    async fn exchange<S>(&self, inbound: S) -> Result<FlightStream<FlightData>, ServerError>
    where
        S: Stream<Item = Result<FlightData, Status>> + Send + Unpin + 'static,
    {
        let blocks = inbound.map(|frame| match frame {
            Ok(frame) => decode::<LobDataBlock>(&frame.data_body),
            Err(status) => Err(ServerError::LobStream(format!(
                "upload stream failed: {}",
                status.message()
            ))),
        });
        let references = self.protocol.create_lob(blocks).await?;
        Ok(references
            .map(|reference| {
                reference
                    .map(|reference| frame(reference.encode_to_vec()))
                    .map_err(|err| status_from_error(&err))
            })
            .boxed())
    }

    async fn read(&self, ticket: &Ticket) -> Result<FlightStream<FlightData>, ServerError> {
        let request: ReadLobRequest = decode(&ticket.ticket)?;
        let blocks = self.protocol.read_lob(request).await?;
        Ok(blocks
            .map(|block| {
                block
                    .map(|block| frame(block.encode_to_vec()))
                    .map_err(|err| status_from_error(&err))
            })
            .boxed())
    }
}

fn frame(body: Vec<u8>) -> FlightData {
    FlightData {
        data_body: Bytes::from(body),
        ..FlightData::default()
    }
}

/// Map an error to a gRPC status carrying the encoded `ErrorResponse`.
pub(crate) fn status_from_error(err: &ServerError) -> Status {
    let code = match (err, err.kind()) {
        (ServerError::MaxSessionsReached | ServerError::ResultTooLarge { .. }, _) => {
            Code::ResourceExhausted
        }
        (ServerError::ConnectionTimeout { .. }, _) => Code::DeadlineExceeded,
        (_, ErrorKind::Connection) => Code::Unavailable,
        (_, ErrorKind::DataException | ErrorKind::InvalidRequest) => Code::InvalidArgument,
        (_, ErrorKind::SqlException) => Code::FailedPrecondition,
        (_, ErrorKind::SessionNotFound | ErrorKind::ResourceNotFound) => Code::NotFound,
        (_, ErrorKind::UnsupportedOperation) => Code::Unimplemented,
        (_, ErrorKind::LobStream) => Code::Aborted,
        (_, ErrorKind::Internal | ErrorKind::Unspecified) => Code::Internal,
    };
    match code {
        Code::Internal => error!(error = %err, "internal error"),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted => {
            warn!(error = %err, ?code, "connection error")
        }
        _ => debug!(error = %err, ?code, "request failed"),
    }
    let details = Bytes::from(err.to_response().encode_to_vec());
    Status::with_details(code, err.to_string(), details)
}

#[tonic::async_trait]
impl FlightService for TunnelFlightService {
    type HandshakeStream = FlightStream<HandshakeResponse>;
    type ListFlightsStream = FlightStream<FlightInfo>;
    type DoGetStream = FlightStream<FlightData>;
    type DoPutStream = FlightStream<PutResult>;
    type DoExchangeStream = FlightStream<FlightData>;
    type DoActionStream = FlightStream<arrow_flight::Result>;
    type ListActionsStream = FlightStream<ActionType>;

    async fn handshake(
        &self,
        _request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        Err(Status::unimplemented("handshake is not used by this server"))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        Err(Status::unimplemented("list_flights is not supported"))
    }

    async fn get_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        Err(Status::unimplemented("get_flight_info is not supported"))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info is not supported"))
    }

    async fn get_schema(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        Err(Status::unimplemented("get_schema is not supported"))
    }

    #[instrument(skip(self, request))]
    async fn do_get(
        &self,
        request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        self.read(request.get_ref())
            .await
            .map(Response::new)
            .map_err(|err| status_from_error(&err))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("do_put is not supported; use do_exchange for lob uploads"))
    }

    #[instrument(skip(self, request))]
    async fn do_exchange(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        self.exchange(request.into_inner())
            .await
            .map(Response::new)
            .map_err(|err| status_from_error(&err))
    }

    #[instrument(skip(self, request), fields(action = %request.get_ref().r#type))]
    async fn do_action(
        &self,
        request: Request<Action>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let body = self
            .run_action(request.get_ref())
            .await
            .map_err(|err| status_from_error(&err))?;
        let reply = arrow_flight::Result { body };
        Ok(Response::new(stream::iter([Ok::<_, Status>(reply)]).boxed()))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = ACTIONS.iter().map(|(name, description)| {
            Ok::<_, Status>(ActionType {
                r#type: name.to_string(),
                description: description.to_string(),
            })
        });
        Ok(Response::new(stream::iter(actions).boxed()))
    }
}
