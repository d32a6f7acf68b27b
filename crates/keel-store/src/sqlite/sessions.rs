use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::instrument;

use keel_core::{
    Checkpoint, CheckpointId, Message, MessageId, NewMessage, OwnerKey, Session, SessionId,
};

use super::row_helpers::{self, fmt_ts};
use super::Database;
use crate::error::StoreError;
use crate::repository::{
    check_rewind_target, ListSessionsQuery, NewCheckpoint, NewSession, SessionPage, SessionPatch,
    SessionRepository,
};
use crate::schema::{CHECKPOINT_COLUMNS, MESSAGE_COLUMNS, SESSION_COLUMNS};

/// `SessionRepository` over a single SQLite connection.
pub struct SqliteSessionRepo {
    db: Database,
}

impl SqliteSessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| StoreError::Database(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepo {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self, new), fields(session_id = %new.id, owner_key = %new.owner_key))]
    async fn create(&self, new: NewSession) -> Result<Session, StoreError> {
        self.blocking(move |conn| insert_session(conn, &new)).await
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        let id = id.clone();
        self.blocking(move |conn| select_session(conn, &id)).await
    }

    #[instrument(skip(self, patch), fields(session_id = %id))]
    async fn update(
        &self,
        id: &SessionId,
        patch: &SessionPatch,
        expected_version: Option<i64>,
    ) -> Result<Session, StoreError> {
        let id = id.clone();
        let patch = patch.clone();
        self.blocking(move |conn| update_session(conn, &id, &patch, expected_version))
            .await
    }

    #[instrument(skip(self, query), fields(owner_key = %query.owner_key, page = query.page))]
    async fn list(&self, query: &ListSessionsQuery) -> Result<SessionPage, StoreError> {
        let query = query.clone();
        self.blocking(move |conn| list_sessions(conn, &query)).await
    }

    #[instrument(skip(self), fields(owner_key = %owner_key))]
    async fn list_ids_by_owner(
        &self,
        owner_key: &OwnerKey,
        limit: u32,
    ) -> Result<Vec<SessionId>, StoreError> {
        let owner_key = owner_key.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE owner_key = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![owner_key.as_str(), i64::from(limit)], |row| {
                    row.get::<_, String>(0)
                })?
                .map(|r| r.map(SessionId::from_raw))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    #[instrument(skip(self, message), fields(session_id = %session_id, role = %message.role))]
    async fn add_message(
        &self,
        session_id: &SessionId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let session_id = session_id.clone();
        self.blocking(move |conn| insert_message(conn, &session_id, &message))
            .await
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn list_messages(
        &self,
        session_id: &SessionId,
        after_sequence: u32,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let session_id = session_id.clone();
        self.blocking(move |conn| {
            ensure_session_exists(conn, &session_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE session_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC LIMIT ?3"
            ))?;
            let mut rows = stmt.query(params![
                session_id.as_str(),
                i64::from(after_sequence),
                i64::from(limit)
            ])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                messages.push(row_to_message(row)?);
            }
            Ok(messages)
        })
        .await
    }

    #[instrument(skip(self, new), fields(session_id = %session_id, label = %new.label))]
    async fn add_checkpoint(
        &self,
        session_id: &SessionId,
        new: NewCheckpoint,
    ) -> Result<Checkpoint, StoreError> {
        let session_id = session_id.clone();
        self.blocking(move |conn| insert_checkpoint(conn, &session_id, &new))
            .await
    }

    #[instrument(skip(self), fields(checkpoint_id = %id))]
    async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint, StoreError> {
        let id = id.clone();
        self.blocking(move |conn| select_checkpoint(conn, &id)).await
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn list_checkpoints(&self, session_id: &SessionId) -> Result<Vec<Checkpoint>, StoreError> {
        let session_id = session_id.clone();
        self.blocking(move |conn| {
            ensure_session_exists(conn, &session_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
                 WHERE session_id = ?1 ORDER BY sequence ASC"
            ))?;
            let mut rows = stmt.query([session_id.as_str()])?;
            let mut checkpoints = Vec::new();
            while let Some(row) = rows.next()? {
                checkpoints.push(row_to_checkpoint(row)?);
            }
            Ok(checkpoints)
        })
        .await
    }

    #[instrument(skip(self), fields(session_id = %session_id, checkpoint_id = %checkpoint_id))]
    async fn rewind(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
        expected_version: Option<i64>,
    ) -> Result<Session, StoreError> {
        let session_id = session_id.clone();
        let checkpoint_id = checkpoint_id.clone();
        self.blocking(move |conn| rewind_session(conn, &session_id, &checkpoint_id, expected_version))
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.blocking(|conn| {
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
        .await
    }
}

fn insert_session(conn: &Connection, new: &NewSession) -> Result<Session, StoreError> {
    let now = fmt_ts(Utc::now());
    let metadata = serde_json::to_string(&new.metadata)?;
    let inserted = conn.execute(
        "INSERT INTO sessions (id, owner_key, model, status, parent_session_id, working_directory,
                               metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?7, ?7)",
        params![
            new.id.as_str(),
            new.owner_key.as_str(),
            new.model,
            new.parent_session_id.as_ref().map(SessionId::as_str),
            new.working_directory,
            metadata,
            now,
        ],
    );
    match inserted {
        Ok(_) => select_session(conn, &new.id),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(StoreError::AlreadyExists {
                entity: "session",
                id: new.id.to_string(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn select_session(conn: &Connection, id: &SessionId) -> Result<Session, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::session_not_found(id.as_str())),
    }
}

fn ensure_session_exists(conn: &Connection, id: &SessionId) -> Result<(), StoreError> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", [id.as_str()], |row| row.get(0))
        .optional()?;
    match found {
        Some(_) => Ok(()),
        None => Err(StoreError::session_not_found(id.as_str())),
    }
}

/// A guarded write touched no row: tell a missing session from a stale version.
fn missed_write(conn: &Connection, id: &SessionId, expected_version: Option<i64>) -> StoreError {
    match ensure_session_exists(conn, id) {
        Err(e) => e,
        Ok(()) => StoreError::Conflict(format!(
            "session {id} is no longer at version {}",
            expected_version.unwrap_or_default()
        )),
    }
}

fn update_session(
    conn: &Connection,
    id: &SessionId,
    patch: &SessionPatch,
    expected_version: Option<i64>,
) -> Result<Session, StoreError> {
    let metadata = patch.metadata.as_ref().map(serde_json::to_string).transpose()?;
    let mut stmt = conn.prepare(&format!(
        "UPDATE sessions SET
            status = COALESCE(?1, status),
            total_turns = COALESCE(?2, total_turns),
            total_cost = COALESCE(?3, total_cost),
            working_directory = COALESCE(?4, working_directory),
            metadata = COALESCE(?5, metadata),
            version = version + 1,
            updated_at = ?6
         WHERE id = ?7 AND (?8 IS NULL OR version = ?8)
         RETURNING {SESSION_COLUMNS}"
    ))?;
    let mut rows = stmt.query(params![
        patch.status.map(|s| s.as_str()),
        patch.total_turns.map(i64::from),
        patch.total_cost,
        patch.working_directory,
        metadata,
        fmt_ts(Utc::now()),
        id.as_str(),
        expected_version,
    ])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(missed_write(conn, id, expected_version)),
    }
}

fn list_sessions(conn: &Connection, query: &ListSessionsQuery) -> Result<SessionPage, StoreError> {
    let mut filter = String::from(" WHERE owner_key = ?1");
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(query.owner_key.as_str().to_string())];

    if let Some(status) = query.status {
        filter.push_str(&format!(" AND status = ?{}", params.len() + 1));
        params.push(Box::new(status.as_str()));
    }
    if let Some(after) = query.created_after {
        filter.push_str(&format!(" AND created_at >= ?{}", params.len() + 1));
        params.push(Box::new(fmt_ts(after)));
    }
    if let Some(before) = query.created_before {
        filter.push_str(&format!(" AND created_at < ?{}", params.len() + 1));
        params.push(Box::new(fmt_ts(before)));
    }

    let tx = conn.unchecked_transaction()?;

    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let total: i64 = tx.query_row(
        &format!("SELECT COUNT(*) FROM sessions{filter}"),
        param_refs.as_slice(),
        |row| row.get(0),
    )?;

    let offset = i64::try_from(query.offset()).unwrap_or(i64::MAX);
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions{filter}
         ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {offset}",
        query.page_size
    );
    let mut sessions = Vec::new();
    {
        let mut stmt = tx.prepare(&sql)?;
        let mut rows = stmt.query(param_refs.as_slice())?;
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
    }
    tx.commit()?;

    Ok(SessionPage {
        sessions,
        total: u64::try_from(total).unwrap_or_default(),
        page: query.page,
        page_size: query.page_size,
    })
}

fn insert_message(
    conn: &Connection,
    session_id: &SessionId,
    message: &NewMessage,
) -> Result<Message, StoreError> {
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;

    let sequence: Option<i64> = tx
        .query_row(
            "UPDATE sessions SET message_count = message_count + 1, updated_at = ?1
             WHERE id = ?2 RETURNING message_count",
            params![fmt_ts(now), session_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(sequence) = sequence else {
        return Err(StoreError::session_not_found(session_id.as_str()));
    };

    let id = MessageId::new();
    tx.execute(
        "INSERT INTO messages (id, session_id, sequence, role, content, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.as_str(),
            session_id.as_str(),
            sequence,
            message.role.as_str(),
            serde_json::to_string(&message.content)?,
            fmt_ts(now),
        ],
    )?;
    tx.commit()?;

    Ok(Message {
        id,
        session_id: session_id.clone(),
        sequence: u32::try_from(sequence).unwrap_or(u32::MAX),
        role: message.role,
        content: message.content.clone(),
        created_at: now,
    })
}

fn insert_checkpoint(
    conn: &Connection,
    session_id: &SessionId,
    new: &NewCheckpoint,
) -> Result<Checkpoint, StoreError> {
    let tx = conn.unchecked_transaction()?;
    let session = select_session(&tx, session_id)?;

    let sequence: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM checkpoints WHERE session_id = ?1",
        [session_id.as_str()],
        |row| row.get(0),
    )?;

    let id = CheckpointId::new();
    let now = Utc::now();
    tx.execute(
        "INSERT INTO checkpoints (id, session_id, sequence, label, total_turns, total_cost,
                                  message_sequence, state_snapshot, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id.as_str(),
            session_id.as_str(),
            sequence,
            new.label,
            i64::from(session.total_turns),
            session.total_cost,
            i64::from(session.message_count),
            new.state_snapshot,
            fmt_ts(now),
        ],
    )?;
    tx.commit()?;

    Ok(Checkpoint {
        id,
        session_id: session_id.clone(),
        sequence: u32::try_from(sequence).unwrap_or(u32::MAX),
        label: new.label.clone(),
        total_turns: session.total_turns,
        total_cost: session.total_cost,
        message_sequence: session.message_count,
        state_snapshot: new.state_snapshot.clone(),
        created_at: now,
        invalidated_at: None,
    })
}

fn select_checkpoint(conn: &Connection, id: &CheckpointId) -> Result<Checkpoint, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = ?1"
    ))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_checkpoint(row),
        None => Err(StoreError::checkpoint_not_found(id.as_str())),
    }
}

fn rewind_session(
    conn: &Connection,
    session_id: &SessionId,
    checkpoint_id: &CheckpointId,
    expected_version: Option<i64>,
) -> Result<Session, StoreError> {
    let tx = conn.unchecked_transaction()?;

    let checkpoint = match select_checkpoint(&tx, checkpoint_id) {
        Ok(cp) => cp,
        Err(StoreError::NotFound { .. }) => {
            return Err(StoreError::CheckpointRejected {
                session_id: session_id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
                reason: "checkpoint does not exist".into(),
            });
        }
        Err(e) => return Err(e),
    };
    check_rewind_target(session_id, &checkpoint)?;

    let now = fmt_ts(Utc::now());
    tx.execute(
        "UPDATE checkpoints SET invalidated_at = ?1
         WHERE session_id = ?2 AND sequence > ?3 AND invalidated_at IS NULL",
        params![now, session_id.as_str(), i64::from(checkpoint.sequence)],
    )?;
    tx.execute(
        "DELETE FROM messages WHERE session_id = ?1 AND sequence > ?2",
        params![session_id.as_str(), i64::from(checkpoint.message_sequence)],
    )?;

    let restored = {
        let mut stmt = tx.prepare(&format!(
            "UPDATE sessions SET
                total_turns = ?1,
                total_cost = ?2,
                message_count = ?3,
                status = CASE WHEN status = 'interrupted' THEN 'active' ELSE status END,
                version = version + 1,
                updated_at = ?4
             WHERE id = ?5 AND (?6 IS NULL OR version = ?6)
             RETURNING {SESSION_COLUMNS}"
        ))?;
        let mut rows = stmt.query(params![
            i64::from(checkpoint.total_turns),
            checkpoint.total_cost,
            i64::from(checkpoint.message_sequence),
            now,
            session_id.as_str(),
            expected_version,
        ])?;
        match rows.next()? {
            Some(row) => row_to_session(row)?,
            None => return Err(missed_write(&tx, session_id, expected_version)),
        }
    };

    tx.commit()?;
    Ok(restored)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let status: String = row_helpers::get(row, 3, "sessions", "status")?;
    let metadata: String = row_helpers::get(row, 9, "sessions", "metadata")?;
    let created_at: String = row_helpers::get(row, 11, "sessions", "created_at")?;
    let updated_at: String = row_helpers::get(row, 12, "sessions", "updated_at")?;

    Ok(Session {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        owner_key: OwnerKey::new(row_helpers::get::<String>(row, 1, "sessions", "owner_key")?),
        model: row_helpers::get(row, 2, "sessions", "model")?,
        status: row_helpers::parse_enum(&status, "sessions", "status")?,
        parent_session_id: row_helpers::get_opt::<String>(row, 4, "sessions", "parent_session_id")?
            .map(SessionId::from_raw),
        total_turns: row_helpers::get_count(row, 5, "sessions", "total_turns")?,
        total_cost: row_helpers::get(row, 6, "sessions", "total_cost")?,
        message_count: row_helpers::get_count(row, 7, "sessions", "message_count")?,
        working_directory: row_helpers::get_opt(row, 8, "sessions", "working_directory")?,
        metadata: row_helpers::parse_json(&metadata, "sessions", "metadata")?,
        version: row_helpers::get(row, 10, "sessions", "version")?,
        created_at: row_helpers::parse_ts(&created_at, "sessions", "created_at")?,
        updated_at: row_helpers::parse_ts(&updated_at, "sessions", "updated_at")?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let role: String = row_helpers::get(row, 3, "messages", "role")?;
    let content: String = row_helpers::get(row, 4, "messages", "content")?;
    let created_at: String = row_helpers::get(row, 5, "messages", "created_at")?;

    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "messages", "session_id")?),
        sequence: row_helpers::get_count(row, 2, "messages", "sequence")?,
        role: row_helpers::parse_enum(&role, "messages", "role")?,
        content: row_helpers::parse_json(&content, "messages", "content")?,
        created_at: row_helpers::parse_ts(&created_at, "messages", "created_at")?,
    })
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<Checkpoint, StoreError> {
    let created_at: String = row_helpers::get(row, 8, "checkpoints", "created_at")?;
    let invalidated_at: Option<String> = row_helpers::get_opt(row, 9, "checkpoints", "invalidated_at")?;

    Ok(Checkpoint {
        id: CheckpointId::from_raw(row_helpers::get::<String>(row, 0, "checkpoints", "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, "checkpoints", "session_id")?),
        sequence: row_helpers::get_count(row, 2, "checkpoints", "sequence")?,
        label: row_helpers::get(row, 3, "checkpoints", "label")?,
        total_turns: row_helpers::get_count(row, 4, "checkpoints", "total_turns")?,
        total_cost: row_helpers::get(row, 5, "checkpoints", "total_cost")?,
        message_sequence: row_helpers::get_count(row, 6, "checkpoints", "message_sequence")?,
        state_snapshot: row_helpers::get_opt(row, 7, "checkpoints", "state_snapshot")?,
        created_at: row_helpers::parse_ts(&created_at, "checkpoints", "created_at")?,
        invalidated_at: invalidated_at
            .map(|raw| row_helpers::parse_ts(&raw, "checkpoints", "invalidated_at"))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use keel_core::{MessageRole, SessionStatus};
    use serde_json::json;

    fn repo() -> SqliteSessionRepo {
        SqliteSessionRepo::new(Database::in_memory().unwrap())
    }

    fn new_session(owner: &str) -> NewSession {
        NewSession {
            id: SessionId::new(),
            owner_key: OwnerKey::new(owner),
            model: "claude-sonnet".into(),
            parent_session_id: None,
            working_directory: Some("/tmp/project".into()),
            metadata: json!({"source": "test"}),
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let repo = repo();
        let created = repo.create(new_session("alice")).await.unwrap();
        assert_eq!(created.status, SessionStatus::Active);
        assert_eq!(created.total_turns, 0);
        assert_eq!(created.message_count, 0);
        assert_eq!(created.version, 1);
        assert_eq!(created.metadata, json!({"source": "test"}));

        let fetched = repo.get(&created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn create_duplicate_id_rejected() {
        let repo = repo();
        let new = new_session("alice");
        repo.create(new.clone()).await.unwrap();
        assert_matches!(
            repo.create(new).await,
            Err(StoreError::AlreadyExists { entity: "session", .. })
        );
    }

    #[tokio::test]
    async fn get_missing_session() {
        let repo = repo();
        assert_matches!(
            repo.get(&SessionId::from_raw("nope")).await,
            Err(StoreError::NotFound { entity: "session", .. })
        );
    }

    #[tokio::test]
    async fn update_bumps_version_and_keeps_untouched_fields() {
        let repo = repo();
        let s = repo.create(new_session("alice")).await.unwrap();
        let patch = SessionPatch {
            total_turns: Some(2),
            total_cost: Some(0.25),
            ..SessionPatch::default()
        };
        let updated = repo.update(&s.id, &patch, Some(s.version)).await.unwrap();
        assert_eq!(updated.total_turns, 2);
        assert!((updated.total_cost - 0.25).abs() < f64::EPSILON);
        assert_eq!(updated.version, s.version + 1);
        assert_eq!(updated.working_directory, s.working_directory);
        assert_eq!(updated.status, SessionStatus::Active);
        assert!(updated.updated_at >= s.updated_at);
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let repo = repo();
        let s = repo.create(new_session("alice")).await.unwrap();
        let patch = SessionPatch {
            total_turns: Some(1),
            ..SessionPatch::default()
        };
        repo.update(&s.id, &patch, Some(s.version)).await.unwrap();
        assert_matches!(
            repo.update(&s.id, &patch, Some(s.version)).await,
            Err(StoreError::Conflict(_))
        );
    }

    #[tokio::test]
    async fn update_missing_session_is_not_found() {
        let repo = repo();
        let patch = SessionPatch {
            total_turns: Some(1),
            ..SessionPatch::default()
        };
        assert_matches!(
            repo.update(&SessionId::from_raw("ghost"), &patch, Some(1)).await,
            Err(StoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn list_is_owner_scoped_and_paginated() {
        let repo = repo();
        for _ in 0..5 {
            repo.create(new_session("alice")).await.unwrap();
        }
        repo.create(new_session("bob")).await.unwrap();

        let mut query = ListSessionsQuery::for_owner(OwnerKey::new("alice"));
        query.page_size = 2;
        let first = repo.list(&query).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.sessions.len(), 2);
        assert!(first.has_more());
        assert!(first.sessions.iter().all(|s| s.owner_key.as_str() == "alice"));

        query.page = 3;
        let last = repo.list(&query).await.unwrap();
        assert_eq!(last.sessions.len(), 1);
        assert!(!last.has_more());

        query.page = 4;
        assert!(repo.list(&query).await.unwrap().sessions.is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let repo = repo();
        let a = repo.create(new_session("alice")).await.unwrap();
        repo.create(new_session("alice")).await.unwrap();
        let patch = SessionPatch {
            status: Some(SessionStatus::Completed),
            ..SessionPatch::default()
        };
        repo.update(&a.id, &patch, None).await.unwrap();

        let mut query = ListSessionsQuery::for_owner(OwnerKey::new("alice"));
        query.status = Some(SessionStatus::Completed);
        let page = repo.list(&query).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.sessions[0].id, a.id);
    }

    #[tokio::test]
    async fn list_ids_by_owner_newest_first() {
        let repo = repo();
        let first = repo.create(new_session("alice")).await.unwrap();
        let second = repo.create(new_session("alice")).await.unwrap();
        repo.create(new_session("bob")).await.unwrap();

        let ids = repo.list_ids_by_owner(&OwnerKey::new("alice"), 10).await.unwrap();
        assert_eq!(ids, vec![second.id, first.id]);

        let limited = repo.list_ids_by_owner(&OwnerKey::new("alice"), 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn messages_get_sequential_numbers() {
        let repo = repo();
        let s = repo.create(new_session("alice")).await.unwrap();
        for i in 0..3 {
            let msg = repo
                .add_message(&s.id, NewMessage::text(MessageRole::User, format!("m{i}")))
                .await
                .unwrap();
            assert_eq!(msg.sequence, i + 1);
        }

        let session = repo.get(&s.id).await.unwrap();
        assert_eq!(session.message_count, 3);
        assert_eq!(session.version, s.version, "appending messages leaves the version alone");

        let tail = repo.list_messages(&s.id, 1, 10).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, json!("m1"));
    }

    #[tokio::test]
    async fn message_on_missing_session_rejected() {
        let repo = repo();
        assert_matches!(
            repo.add_message(&SessionId::from_raw("ghost"), NewMessage::text(MessageRole::User, "hi"))
                .await,
            Err(StoreError::NotFound { .. })
        );
    }

    #[tokio::test]
    async fn checkpoint_captures_counters() {
        let repo = repo();
        let s = repo.create(new_session("alice")).await.unwrap();
        repo.add_message(&s.id, NewMessage::text(MessageRole::User, "hi")).await.unwrap();
        let patch = SessionPatch {
            total_turns: Some(1),
            total_cost: Some(0.1),
            ..SessionPatch::default()
        };
        repo.update(&s.id, &patch, None).await.unwrap();

        let cp = repo
            .add_checkpoint(&s.id, NewCheckpoint { label: "after-1".into(), state_snapshot: None })
            .await
            .unwrap();
        assert_eq!(cp.sequence, 1);
        assert_eq!(cp.total_turns, 1);
        assert_eq!(cp.message_sequence, 1);
        assert!(cp.is_valid());

        assert_eq!(repo.get_checkpoint(&cp.id).await.unwrap(), cp);
        assert_eq!(repo.list_checkpoints(&s.id).await.unwrap(), vec![cp]);
    }

    #[tokio::test]
    async fn rewind_restores_and_invalidates_later_checkpoints() {
        let repo = repo();
        let s = repo.create(new_session("alice")).await.unwrap();
        repo.update(&s.id, &SessionPatch { total_turns: Some(3), total_cost: Some(0.3), ..Default::default() }, None)
            .await
            .unwrap();
        repo.add_message(&s.id, NewMessage::text(MessageRole::User, "one")).await.unwrap();
        let cp3 = repo
            .add_checkpoint(&s.id, NewCheckpoint { label: "t3".into(), state_snapshot: Some("snap".into()) })
            .await
            .unwrap();

        repo.update(&s.id, &SessionPatch { total_turns: Some(7), total_cost: Some(0.7), ..Default::default() }, None)
            .await
            .unwrap();
        repo.add_message(&s.id, NewMessage::text(MessageRole::Assistant, "two")).await.unwrap();
        let cp7 = repo
            .add_checkpoint(&s.id, NewCheckpoint { label: "t7".into(), state_snapshot: None })
            .await
            .unwrap();
        let interrupted = repo
            .update(&s.id, &SessionPatch { status: Some(SessionStatus::Interrupted), ..Default::default() }, None)
            .await
            .unwrap();

        let restored = repo.rewind(&s.id, &cp3.id, Some(interrupted.version)).await.unwrap();
        assert_eq!(restored.total_turns, 3);
        assert!((restored.total_cost - 0.3).abs() < f64::EPSILON);
        assert_eq!(restored.message_count, 1);
        assert_eq!(restored.status, SessionStatus::Active);
        assert_eq!(restored.version, interrupted.version + 1);

        let messages = repo.list_messages(&s.id, 0, 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(!repo.get_checkpoint(&cp7.id).await.unwrap().is_valid());
        assert!(repo.get_checkpoint(&cp3.id).await.unwrap().is_valid());

        assert_matches!(
            repo.rewind(&s.id, &cp7.id, None).await,
            Err(StoreError::CheckpointRejected { .. })
        );

        // A new message after the rewind reuses the freed sequence.
        let msg = repo.add_message(&s.id, NewMessage::text(MessageRole::User, "again")).await.unwrap();
        assert_eq!(msg.sequence, 2);
    }

    #[tokio::test]
    async fn rewind_keeps_completed_status() {
        let repo = repo();
        let s = repo.create(new_session("alice")).await.unwrap();
        let cp = repo
            .add_checkpoint(&s.id, NewCheckpoint { label: "start".into(), state_snapshot: None })
            .await
            .unwrap();
        repo.update(&s.id, &SessionPatch { status: Some(SessionStatus::Completed), ..Default::default() }, None)
            .await
            .unwrap();
        let restored = repo.rewind(&s.id, &cp.id, None).await.unwrap();
        assert_eq!(restored.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn rewind_rejects_foreign_and_unknown_checkpoints() {
        let repo = repo();
        let a = repo.create(new_session("alice")).await.unwrap();
        let b = repo.create(new_session("alice")).await.unwrap();
        let cp_b = repo
            .add_checkpoint(&b.id, NewCheckpoint { label: "b".into(), state_snapshot: None })
            .await
            .unwrap();

        assert_matches!(
            repo.rewind(&a.id, &cp_b.id, None).await,
            Err(StoreError::CheckpointRejected { .. })
        );
        assert_matches!(
            repo.rewind(&a.id, &CheckpointId::from_raw("ckpt_missing"), None).await,
            Err(StoreError::CheckpointRejected { .. })
        );
    }

    #[tokio::test]
    async fn rewind_with_stale_version_rolls_back() {
        let repo = repo();
        let s = repo.create(new_session("alice")).await.unwrap();
        let cp = repo
            .add_checkpoint(&s.id, NewCheckpoint { label: "start".into(), state_snapshot: None })
            .await
            .unwrap();
        repo.add_message(&s.id, NewMessage::text(MessageRole::User, "kept")).await.unwrap();
        repo.update(&s.id, &SessionPatch { total_turns: Some(1), ..Default::default() }, None)
            .await
            .unwrap();

        assert_matches!(
            repo.rewind(&s.id, &cp.id, Some(s.version)).await,
            Err(StoreError::Conflict(_))
        );
        assert_eq!(repo.list_messages(&s.id, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_status_in_row_is_corrupt() {
        let repo = repo();
        let s = repo.create(new_session("alice")).await.unwrap();
        let id = s.id.clone();
        repo.database()
            .with_conn(move |conn| {
                conn.execute("UPDATE sessions SET status = 'exploded' WHERE id = ?1", [id.as_str()])?;
                Ok(())
            })
            .unwrap();
        assert_matches!(
            repo.get(&s.id).await,
            Err(StoreError::CorruptRow { table: "sessions", column: "status", .. })
        );
    }

    #[tokio::test]
    async fn ping_succeeds() {
        repo().ping().await.unwrap();
    }
}
