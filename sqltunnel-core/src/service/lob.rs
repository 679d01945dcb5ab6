use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, instrument};

use super::ProtocolService;
use crate::error::ServerError;
use crate::lob::LobResource;
use crate::protocol::{LobDataBlock, LobReference, LobType, ReadLobRequest};
use crate::session::{ResourceId, ResourceKind};

type References = ReceiverStream<Result<LobReference, ServerError>>;
type Blocks = ReceiverStream<Result<LobDataBlock, ServerError>>;

enum UploadTo {
    Existing(ResourceId),
    New(LobType),
}

impl ProtocolService {
    /// Apply an upload stream to a LOB. The first block names the session and
    /// either an existing LOB or, with an empty id, the type of a new one.
    /// A LOB always lives in a registered session.
    #[instrument(skip(self, blocks))]
    pub async fn create_lob<S>(&self, mut blocks: S) -> Result<References, ServerError>
    where
        S: Stream<Item = Result<LobDataBlock, ServerError>> + Send + Unpin + 'static,
    {
        let first = blocks.next().await.ok_or_else(|| {
            ServerError::InvalidRequest("lob upload carried no blocks".to_string())
        })??;
        let shell = first.session.clone().unwrap_or_default();
        let destination = if first.lob_uuid.is_empty() {
            UploadTo::New(LobType::try_from(first.lob_type).map_err(|_| {
                ServerError::InvalidRequest(format!("unknown lob type {}", first.lob_type))
            })?)
        } else {
            let id = ResourceId::parse(&first.lob_uuid)?;
            if !shell.has_session() {
                return Err(ServerError::resource_not_found(ResourceKind::Lob, id));
            }
            UploadTo::Existing(id)
        };
        let claim = self.stateful_session(&shell).await?;
        claim.session().touch();

        let lob = match destination {
            UploadTo::Existing(id) => claim.session().resources().lob(&id)?,
            UploadTo::New(lob_type) => {
                let lob = Arc::new(LobResource::for_upload(lob_type));
                claim.session().resources().register_lob(lob.clone());
                lob
            }
        };
        let session = claim.keep();
        info!(
            session_id = %session.id(),
            lob_id = %lob.id(),
            lob_type = ?lob.lob_type(),
            "lob upload started"
        );
        Ok(self.lobs.upload(lob, session.info(), first, blocks))
    }

    /// Stream a LOB registered in the reference's session.
    #[instrument(skip(self, request))]
    pub async fn read_lob(&self, request: ReadLobRequest) -> Result<Blocks, ServerError> {
        let reference = request
            .reference
            .ok_or_else(|| ServerError::InvalidRequest("lob read without a reference".to_string()))?;
        let shell = reference.session.clone().unwrap_or_default();
        if !shell.has_session() {
            return Err(ServerError::resource_not_found(
                ResourceKind::Lob,
                &reference.lob_uuid,
            ));
        }
        let session = self.sessions.get(&shell)?;
        session.touch();
        let lob = session
            .resources()
            .lob(&ResourceId::parse(&reference.lob_uuid)?)?;
        self.lobs
            .download(lob, session.info(), request.position, request.length)
            .await
    }
}
