//! Application of agent lifecycle events.
//!
//! Events carry absolute counters, so each can be checked against the stored
//! row and applied at most once. Redelivery is reported, never an error.

use serde::Serialize;
use tracing::{debug, info, instrument};

use keel_core::events::AgentEvent;
use keel_core::{NewMessage, OwnerKey, Session, SessionError, SessionId, SessionStatus};

use crate::errors::from_store;
use crate::service::{CreateSession, SessionService};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    /// The event changed the session.
    Applied { session: Session },
    /// Already reflected in the session (redelivery).
    Duplicate { session: Session },
    /// The session is terminal; the event no longer applies.
    Ignored { session: Session, reason: String },
}

impl EventOutcome {
    pub fn session(&self) -> &Session {
        match self {
            Self::Applied { session } | Self::Duplicate { session } | Self::Ignored { session, .. } => session,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

impl SessionService {
    #[instrument(skip(self, event), fields(session_id = %event.session_id(), kind = event.kind()))]
    pub async fn apply_agent_event(&self, event: AgentEvent) -> Result<EventOutcome, SessionError> {
        let outcome = match event {
            AgentEvent::Init {
                session_id,
                owner_key,
                model,
                working_directory,
            } => self.apply_init(session_id, owner_key, model, working_directory).await?,
            AgentEvent::Turn {
                session_id,
                turn,
                total_cost,
                messages,
            } => self.apply_turn(&session_id, turn, total_cost, messages).await?,
            AgentEvent::Error { session_id, message } => {
                self.apply_error(&session_id, message).await?
            }
            AgentEvent::Done {
                session_id,
                total_cost,
                interrupted,
            } => self.apply_done(&session_id, total_cost, interrupted).await?,
        };
        debug!(applied = outcome.is_applied(), "agent event handled");
        Ok(outcome)
    }

    async fn apply_init(
        &self,
        session_id: SessionId,
        owner_key: OwnerKey,
        model: String,
        working_directory: Option<String>,
    ) -> Result<EventOutcome, SessionError> {
        let existing = match self.get_session(&session_id).await {
            Ok(session) => Some(session),
            Err(SessionError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        if let Some(session) = existing {
            return duplicate_init(session, &owner_key);
        }

        let mut request = CreateSession::new(owner_key.clone(), model).with_id(session_id.as_str());
        request.working_directory = working_directory;
        match self.create_session(request).await {
            Ok(session) => Ok(EventOutcome::Applied { session }),
            Err(SessionError::InvalidConfiguration(detail)) => match self.repo.get(&session_id).await {
                // Lost a race with a concurrent redelivery.
                Ok(session) => duplicate_init(session, &owner_key),
                Err(_) => Err(SessionError::InvalidConfiguration(detail)),
            },
            Err(e) => Err(e),
        }
    }

    async fn apply_turn(
        &self,
        session_id: &SessionId,
        turn: u32,
        total_cost: f64,
        messages: Vec<NewMessage>,
    ) -> Result<EventOutcome, SessionError> {
        if !total_cost.is_finite() || total_cost < 0.0 {
            return Err(SessionError::InvalidConfiguration(format!(
                "turn event for {session_id} carries invalid cost {total_cost}"
            )));
        }

        let lease = self.lock(session_id).await?;
        let result = self.turn_locked(session_id, turn, total_cost, messages).await;
        if let Ok(EventOutcome::Applied { session }) = &result {
            self.cache.refresh(session).await;
        }
        self.unlock(lease).await;
        result
    }

    /// Messages are appended before the counters move, so an interrupted
    /// apply is redelivered in full rather than losing messages.
    async fn turn_locked(
        &self,
        session_id: &SessionId,
        turn: u32,
        total_cost: f64,
        messages: Vec<NewMessage>,
    ) -> Result<EventOutcome, SessionError> {
        let current = self
            .repo
            .get(session_id)
            .await
            .map_err(|e| from_store(e, Some(session_id)))?;
        if current.status.is_terminal() {
            return Ok(EventOutcome::Ignored {
                reason: format!("session is {}", current.status),
                session: current,
            });
        }
        if turn <= current.total_turns {
            return Ok(EventOutcome::Duplicate { session: current });
        }

        for message in messages {
            self.repo
                .add_message(session_id, message)
                .await
                .map_err(|e| from_store(e, Some(session_id)))?;
        }

        let session = self
            .apply_locked(session_id, &mut |s: &mut Session| {
                if s.status == SessionStatus::Active && turn > s.total_turns {
                    s.total_turns = turn;
                    s.total_cost = s.total_cost.max(total_cost);
                }
                Ok(())
            })
            .await?;
        Ok(EventOutcome::Applied { session })
    }

    async fn apply_error(&self, session_id: &SessionId, message: String) -> Result<EventOutcome, SessionError> {
        let lease = self.lock(session_id).await?;
        let result = self.error_locked(session_id, message).await;
        if let Ok(EventOutcome::Applied { session }) = &result {
            self.cache.refresh(session).await;
            self.forget_interrupt(session_id).await;
        }
        self.unlock(lease).await;
        result
    }

    async fn error_locked(&self, session_id: &SessionId, message: String) -> Result<EventOutcome, SessionError> {
        let current = self
            .repo
            .get(session_id)
            .await
            .map_err(|e| from_store(e, Some(session_id)))?;
        if current.status.is_terminal() {
            return Ok(EventOutcome::Ignored {
                reason: format!("session is {}", current.status),
                session: current,
            });
        }

        let session = self
            .apply_locked(session_id, &mut |s: &mut Session| {
                if s.status == SessionStatus::Active {
                    s.status = SessionStatus::Error;
                    if s.metadata.is_null() {
                        s.metadata = serde_json::Value::Object(serde_json::Map::new());
                    }
                    if let Some(meta) = s.metadata.as_object_mut() {
                        meta.insert("lastError".into(), serde_json::Value::String(message.clone()));
                    }
                }
                Ok(())
            })
            .await?;
        info!(session_id = %session_id, "session failed");
        Ok(EventOutcome::Applied { session })
    }

    async fn apply_done(
        &self,
        session_id: &SessionId,
        total_cost: Option<f64>,
        interrupted: bool,
    ) -> Result<EventOutcome, SessionError> {
        if let Some(cost) = total_cost {
            if !cost.is_finite() || cost < 0.0 {
                return Err(SessionError::InvalidConfiguration(format!(
                    "done event for {session_id} carries invalid cost {cost}"
                )));
            }
        }

        let lease = self.lock(session_id).await?;
        let interrupted = interrupted || self.is_interrupted(session_id).await;
        let result = self.done_locked(session_id, total_cost, interrupted).await;
        if let Ok(EventOutcome::Applied { session }) = &result {
            self.cache.refresh(session).await;
            self.forget_interrupt(session_id).await;
        }
        self.unlock(lease).await;
        result
    }

    async fn done_locked(
        &self,
        session_id: &SessionId,
        total_cost: Option<f64>,
        interrupted: bool,
    ) -> Result<EventOutcome, SessionError> {
        let current = self
            .repo
            .get(session_id)
            .await
            .map_err(|e| from_store(e, Some(session_id)))?;
        if current.status.is_terminal() {
            // Finalised already; a second `done` must not touch the cost.
            return Ok(EventOutcome::Duplicate { session: current });
        }

        let target = if interrupted {
            SessionStatus::Interrupted
        } else {
            SessionStatus::Completed
        };
        let session = self
            .apply_locked(session_id, &mut |s: &mut Session| {
                if s.status == SessionStatus::Active {
                    s.status = target;
                    if let Some(cost) = total_cost {
                        s.total_cost = s.total_cost.max(cost);
                    }
                }
                Ok(())
            })
            .await?;
        info!(session_id = %session_id, status = %session.status, total_cost = session.total_cost, "session finalised");
        Ok(EventOutcome::Applied { session })
    }
}

fn duplicate_init(session: Session, owner_key: &OwnerKey) -> Result<EventOutcome, SessionError> {
    if session.owner_key != *owner_key {
        return Err(SessionError::InvalidConfiguration(format!(
            "session {} already exists under another owner",
            session.id
        )));
    }
    Ok(EventOutcome::Duplicate { session })
}
