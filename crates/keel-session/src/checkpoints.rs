//! Named restore points and rewind.

use tracing::{info, instrument};

use keel_core::{Checkpoint, CheckpointId, Session, SessionError, SessionId, SessionStatus};
use keel_store::{NewCheckpoint, StoreError};

use crate::errors::from_store;
use crate::service::SessionService;

impl SessionService {
    /// Record the session's current counters under `label`. Taken under the
    /// session lock so the snapshot never interleaves with a write.
    #[instrument(skip(self, state_snapshot), fields(session_id = %session_id, label))]
    pub async fn create_checkpoint(
        &self,
        session_id: &SessionId,
        label: &str,
        state_snapshot: Option<String>,
    ) -> Result<Checkpoint, SessionError> {
        if label.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration("checkpoint label must not be empty".into()));
        }

        let lease = self.lock(session_id).await?;
        let result = self.checkpoint_locked(session_id, label, state_snapshot).await;
        self.unlock(lease).await;

        let checkpoint = result?;
        info!(checkpoint_id = %checkpoint.id, sequence = checkpoint.sequence, "checkpoint created");
        Ok(checkpoint)
    }

    async fn checkpoint_locked(
        &self,
        session_id: &SessionId,
        label: &str,
        state_snapshot: Option<String>,
    ) -> Result<Checkpoint, SessionError> {
        let session = self
            .repo
            .get(session_id)
            .await
            .map_err(|e| from_store(e, Some(session_id)))?;
        if session.status != SessionStatus::Active {
            return Err(SessionError::InvalidConfiguration(format!(
                "session {session_id} is {}; checkpoints require an active session",
                session.status
            )));
        }
        self.repo
            .add_checkpoint(
                session_id,
                NewCheckpoint {
                    label: label.to_string(),
                    state_snapshot,
                },
            )
            .await
            .map_err(|e| from_store(e, Some(session_id)))
    }

    /// All checkpoints of the session in creation order. Ones discarded by a
    /// rewind are included with `invalidated_at` set.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn list_checkpoints(&self, session_id: &SessionId) -> Result<Vec<Checkpoint>, SessionError> {
        self.repo
            .list_checkpoints(session_id)
            .await
            .map_err(|e| from_store(e, Some(session_id)))
    }

    /// Restore the session to `checkpoint_id`: counters reset, later messages
    /// dropped, later checkpoints invalidated, `interrupted` back to `active`.
    #[instrument(skip(self), fields(session_id = %session_id, checkpoint_id = %checkpoint_id))]
    pub async fn rewind(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Session, SessionError> {
        let lease = self.lock(session_id).await?;
        let result = self.rewind_locked(session_id, checkpoint_id).await;
        if let Ok(session) = &result {
            self.cache.refresh(session).await;
            self.forget_interrupt(session_id).await;
        }
        self.unlock(lease).await;

        let session = result?;
        info!(total_turns = session.total_turns, status = %session.status, "session rewound");
        Ok(session)
    }

    async fn rewind_locked(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
    ) -> Result<Session, SessionError> {
        let attempts = self.settings.max_update_retries.saturating_add(1);
        for _ in 0..attempts {
            let current = self
                .repo
                .get(session_id)
                .await
                .map_err(|e| from_store(e, Some(session_id)))?;
            match self
                .repo
                .rewind(session_id, checkpoint_id, Some(current.version))
                .await
            {
                Ok(session) => return Ok(session),
                Err(StoreError::Conflict(_)) => continue,
                Err(e) => return Err(from_store(e, Some(session_id))),
            }
        }
        Err(SessionError::Conflict {
            session_id: session_id.clone(),
        })
    }
}
