use tracing::{info, instrument};

use super::{blocking, ProtocolService};
use crate::error::ServerError;
use crate::protocol::SessionInfo;
use crate::session::{Session, TransactionId};

impl ProtocolService {
    /// Begin a transaction, creating the session if the shell has none.
    #[instrument(skip(self, shell), fields(session_id = %shell.session_uuid))]
    pub async fn start_transaction(&self, shell: SessionInfo) -> Result<SessionInfo, ServerError> {
        let claim = self.stateful_session(&shell).await?;
        let worker = claim.session().clone();
        let result = blocking(move || worker.begin_transaction()).await;
        let transaction_id = self.settle(claim.session(), result)?;
        let session = claim.keep();
        info!(session_id = %session.id(), %transaction_id, "transaction started");
        Ok(session.info())
    }

    #[instrument(skip(self, shell), fields(session_id = %shell.session_uuid))]
    pub async fn commit_transaction(&self, shell: SessionInfo) -> Result<SessionInfo, ServerError> {
        self.end_transaction(&shell, Session::commit_transaction, "committed")
            .await
    }

    #[instrument(skip(self, shell), fields(session_id = %shell.session_uuid))]
    pub async fn rollback_transaction(&self, shell: SessionInfo) -> Result<SessionInfo, ServerError> {
        self.end_transaction(&shell, Session::rollback_transaction, "rolled back")
            .await
    }

    async fn end_transaction(
        &self,
        shell: &SessionInfo,
        end: fn(&Session) -> Result<TransactionId, ServerError>,
        op: &'static str,
    ) -> Result<SessionInfo, ServerError> {
        if !shell.has_session() {
            return Err(ServerError::TransactionNotActive);
        }
        let session = self.sessions.get(shell)?;
        let worker = session.clone();
        let result = blocking(move || end(&worker)).await;
        let transaction_id = self.settle(&session, result)?;
        info!(session_id = %session.id(), %transaction_id, op, "transaction completed");
        Ok(session.info())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};

    use super::*;
    use crate::protocol::StatementRequest;
    use crate::service::tests::{connect, test_service};

    #[tokio::test(flavor = "multi_thread")]
    async fn start_creates_a_session_that_commit_keeps() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        let started = service
            .start_transaction(shell.clone())
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(started.has_session());
        assert!(started.transaction.is_some());
        assert_eq!(service.sessions().len(), 1);

        service
            .execute_update(StatementRequest {
                session: Some(started.clone()),
                sql: "CREATE TABLE t(id INT)".to_string(),
                ..StatementRequest::default()
            })
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        let committed = service
            .commit_transaction(started.clone())
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        assert_eq!(committed.session_uuid, started.session_uuid);
        assert!(committed.transaction.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ending_without_a_transaction_is_rejected() -> Result<()> {
        let service = test_service();
        let shell = connect(&service).await?;
        assert!(matches!(
            service.rollback_transaction(shell.clone()).await,
            Err(ServerError::TransactionNotActive)
        ));
        let started = service
            .start_transaction(shell)
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        service
            .rollback_transaction(started.clone())
            .await
            .map_err(|e| anyhow!(e.to_string()))?;
        assert!(matches!(
            service.commit_transaction(started).await,
            Err(ServerError::TransactionNotActive)
        ));
        Ok(())
    }
}
