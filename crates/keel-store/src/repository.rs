//! The persistent store contract consumed by the session service.
//!
//! Ownership scoping happens inside the queries (`WHERE owner_key = …`), never
//! by filtering results after the fact. Every multi-statement operation runs
//! in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keel_core::{Checkpoint, CheckpointId, Message, NewMessage, OwnerKey, Session, SessionId, SessionStatus};

use crate::error::StoreError;

/// Fields for a new session row. Status starts as `active`, counters at zero.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub id: SessionId,
    pub owner_key: OwnerKey,
    pub model: String,
    pub parent_session_id: Option<SessionId>,
    pub working_directory: Option<String>,
    pub metadata: serde_json::Value,
}

/// Partial update of the mutable session fields. `None` leaves a column as is.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub total_turns: Option<u32>,
    pub total_cost: Option<f64>,
    pub working_directory: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Patch that turns `before` into `after` for the mutable fields.
    pub fn diff(before: &Session, after: &Session) -> Self {
        Self {
            status: (before.status != after.status).then_some(after.status),
            total_turns: (before.total_turns != after.total_turns).then_some(after.total_turns),
            total_cost: (before.total_cost != after.total_cost).then_some(after.total_cost),
            working_directory: if before.working_directory != after.working_directory {
                after.working_directory.clone()
            } else {
                None
            },
            metadata: (before.metadata != after.metadata).then(|| after.metadata.clone()),
        }
    }
}

/// Owner-scoped, paginated listing request.
#[derive(Clone, Debug)]
pub struct ListSessionsQuery {
    pub owner_key: OwnerKey,
    pub status: Option<SessionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// 1-based page number.
    pub page: u32,
    pub page_size: u32,
}

impl ListSessionsQuery {
    pub fn for_owner(owner_key: OwnerKey) -> Self {
        Self {
            owner_key,
            status: None,
            created_after: None,
            created_before: None,
            page: 1,
            page_size: 20,
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

/// One page of sessions plus the total number of matches.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl SessionPage {
    pub fn has_more(&self) -> bool {
        u64::from(self.page) * u64::from(self.page_size) < self.total
    }
}

#[derive(Clone, Debug)]
pub struct NewCheckpoint {
    pub label: String,
    pub state_snapshot: Option<String>,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Short backend name for logs (`sqlite`, `postgres`).
    fn backend(&self) -> &'static str;

    /// Insert a new `active` session. Fails with `AlreadyExists` on id reuse.
    async fn create(&self, new: NewSession) -> Result<Session, StoreError>;

    async fn get(&self, id: &SessionId) -> Result<Session, StoreError>;

    /// Apply `patch` in a single `UPDATE … RETURNING` statement. With
    /// `expected_version`, the write only lands if the row is still at that
    /// version; otherwise `Conflict`.
    async fn update(
        &self,
        id: &SessionId,
        patch: &SessionPatch,
        expected_version: Option<i64>,
    ) -> Result<Session, StoreError>;

    async fn list(&self, query: &ListSessionsQuery) -> Result<SessionPage, StoreError>;

    /// Ids of an owner's sessions, newest first, at most `limit`.
    async fn list_ids_by_owner(&self, owner_key: &OwnerKey, limit: u32) -> Result<Vec<SessionId>, StoreError>;

    /// Append a message and bump the session's message counter atomically.
    async fn add_message(&self, session_id: &SessionId, message: NewMessage) -> Result<Message, StoreError>;

    /// Messages with `sequence > after_sequence`, in append order.
    async fn list_messages(
        &self,
        session_id: &SessionId,
        after_sequence: u32,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;

    /// Record a checkpoint capturing the session's current counters.
    async fn add_checkpoint(&self, session_id: &SessionId, new: NewCheckpoint) -> Result<Checkpoint, StoreError>;

    async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint, StoreError>;

    /// All checkpoints of a session in creation order, invalidated ones included.
    async fn list_checkpoints(&self, session_id: &SessionId) -> Result<Vec<Checkpoint>, StoreError>;

    /// Restore the session to `checkpoint_id` in one transaction: counters
    /// reset, later messages dropped, later checkpoints invalidated, and an
    /// `interrupted` session made `active` again.
    async fn rewind(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
        expected_version: Option<i64>,
    ) -> Result<Session, StoreError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Validate a checkpoint against the session it is being rewound on.
/// Shared by the backends so both reject the same cases.
pub(crate) fn check_rewind_target(
    session_id: &SessionId,
    checkpoint: &Checkpoint,
) -> Result<(), StoreError> {
    let reject = |reason: &str| StoreError::CheckpointRejected {
        session_id: session_id.to_string(),
        checkpoint_id: checkpoint.id.to_string(),
        reason: reason.to_string(),
    };
    if checkpoint.session_id != *session_id {
        return Err(reject("checkpoint belongs to a different session"));
    }
    if !checkpoint.is_valid() {
        return Err(reject("checkpoint was discarded by an earlier rewind"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::from_raw("s1"),
            owner_key: OwnerKey::new("o"),
            model: "sonnet".into(),
            status: SessionStatus::Active,
            parent_session_id: None,
            total_turns: 0,
            total_cost: 0.0,
            message_count: 0,
            working_directory: None,
            metadata: serde_json::json!({}),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn diff_of_identical_sessions_is_empty() {
        let s = session();
        assert!(SessionPatch::diff(&s, &s.clone()).is_empty());
    }

    #[test]
    fn diff_picks_changed_fields_only() {
        let before = session();
        let mut after = before.clone();
        after.total_turns = 3;
        after.status = SessionStatus::Completed;
        let patch = SessionPatch::diff(&before, &after);
        assert_eq!(patch.total_turns, Some(3));
        assert_eq!(patch.status, Some(SessionStatus::Completed));
        assert_eq!(patch.total_cost, None);
        assert_eq!(patch.metadata, None);
    }

    #[test]
    fn query_offset() {
        let mut q = ListSessionsQuery::for_owner(OwnerKey::new("o"));
        assert_eq!(q.offset(), 0);
        q.page = 3;
        q.page_size = 25;
        assert_eq!(q.offset(), 50);
    }

    #[test]
    fn page_has_more() {
        let page = SessionPage {
            sessions: vec![],
            total: 45,
            page: 2,
            page_size: 20,
        };
        assert!(page.has_more());
        let last = SessionPage { page: 3, ..page };
        assert!(!last.has_more());
    }
}
