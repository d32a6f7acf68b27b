use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use tracing::instrument;

use keel_core::{
    Checkpoint, CheckpointId, Message, MessageId, NewMessage, OwnerKey, Session, SessionId,
};

use crate::error::StoreError;
use crate::repository::{
    check_rewind_target, ListSessionsQuery, NewCheckpoint, NewSession, SessionPage, SessionPatch,
    SessionRepository,
};
use crate::schema::{CHECKPOINT_COLUMNS, MESSAGE_COLUMNS, SESSION_COLUMNS};

/// `SessionRepository` over a sqlx connection pool.
#[derive(Clone)]
pub struct PgSessionRepo {
    pool: PgPool,
}

impl std::fmt::Debug for PgSessionRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSessionRepo").finish()
    }
}

impl PgSessionRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepo {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, new), fields(session_id = %new.id, owner_key = %new.owner_key))]
    async fn create(&self, new: NewSession) -> Result<Session, StoreError> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO sessions (id, owner_key, model, status, parent_session_id,
                                   working_directory, metadata)
             VALUES ($1, $2, $3, 'active', $4, $5, $6)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(new.id.as_str())
        .bind(new.owner_key.as_str())
        .bind(&new.model)
        .bind(new.parent_session_id.as_ref().map(SessionId::as_str))
        .bind(new.working_directory.as_deref())
        .bind(&new.metadata)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => row_to_session(&row),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists {
                    entity: "session",
                    id: new.id.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(session_id = %id))]
    async fn get(&self, id: &SessionId) -> Result<Session, StoreError> {
        let mut conn = self.pool.acquire().await?;
        select_session(&mut conn, id, false).await
    }

    #[instrument(skip(self, patch), fields(session_id = %id))]
    async fn update(
        &self,
        id: &SessionId,
        patch: &SessionPatch,
        expected_version: Option<i64>,
    ) -> Result<Session, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&format!(
            "UPDATE sessions SET
                status = COALESCE($1, status),
                total_turns = COALESCE($2, total_turns),
                total_cost = COALESCE($3, total_cost),
                working_directory = COALESCE($4, working_directory),
                metadata = COALESCE($5, metadata),
                version = version + 1,
                updated_at = NOW()
             WHERE id = $6 AND ($7::BIGINT IS NULL OR version = $7)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.total_turns.map(counter_to_db))
        .bind(patch.total_cost)
        .bind(patch.working_directory.as_deref())
        .bind(patch.metadata.as_ref())
        .bind(id.as_str())
        .bind(expected_version)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => row_to_session(&row),
            None => Err(missed_write(&mut conn, id, expected_version).await),
        }
    }

    #[instrument(skip(self, query), fields(owner_key = %query.owner_key, page = query.page))]
    async fn list(&self, query: &ListSessionsQuery) -> Result<SessionPage, StoreError> {
        let mut filter = String::from(" WHERE owner_key = $1");
        let mut next = 2;
        if query.status.is_some() {
            filter.push_str(&format!(" AND status = ${next}"));
            next += 1;
        }
        if query.created_after.is_some() {
            filter.push_str(&format!(" AND created_at >= ${next}"));
            next += 1;
        }
        if query.created_before.is_some() {
            filter.push_str(&format!(" AND created_at < ${next}"));
        }

        let count_sql = format!("SELECT COUNT(*) AS total FROM sessions{filter}");
        let page_sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions{filter}
             ORDER BY created_at DESC, id DESC LIMIT {} OFFSET {}",
            query.page_size,
            query.offset()
        );

        let mut tx = self.pool.begin().await?;

        let mut count_query = sqlx::query(&count_sql).bind(query.owner_key.as_str());
        let mut page_query = sqlx::query(&page_sql).bind(query.owner_key.as_str());
        if let Some(status) = query.status {
            count_query = count_query.bind(status.as_str());
            page_query = page_query.bind(status.as_str());
        }
        if let Some(after) = query.created_after {
            count_query = count_query.bind(after);
            page_query = page_query.bind(after);
        }
        if let Some(before) = query.created_before {
            count_query = count_query.bind(before);
            page_query = page_query.bind(before);
        }

        let total: i64 = count_query.fetch_one(&mut *tx).await?.try_get("total")?;
        let rows = page_query.fetch_all(&mut *tx).await?;
        tx.commit().await?;

        Ok(SessionPage {
            sessions: rows.iter().map(row_to_session).collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or_default(),
            page: query.page,
            page_size: query.page_size,
        })
    }

    #[instrument(skip(self), fields(owner_key = %owner_key))]
    async fn list_ids_by_owner(
        &self,
        owner_key: &OwnerKey,
        limit: u32,
    ) -> Result<Vec<SessionId>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM sessions WHERE owner_key = $1
             ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(owner_key.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let id: String = col(row, "sessions", "id")?;
                Ok(SessionId::from_raw(id))
            })
            .collect()
    }

    #[instrument(skip(self, message), fields(session_id = %session_id, role = %message.role))]
    async fn add_message(
        &self,
        session_id: &SessionId,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let mut tx = self.pool.begin().await?;

        let counter = sqlx::query(
            "UPDATE sessions SET message_count = message_count + 1, updated_at = NOW()
             WHERE id = $1 RETURNING message_count",
        )
        .bind(session_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(counter) = counter else {
            return Err(StoreError::session_not_found(session_id.as_str()));
        };
        let sequence: i32 = col(&counter, "sessions", "message_count")?;

        let row = sqlx::query(&format!(
            "INSERT INTO messages (id, session_id, sequence, role, content)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(MessageId::new().as_str())
        .bind(session_id.as_str())
        .bind(sequence)
        .bind(message.role.as_str())
        .bind(&message.content)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        row_to_message(&row)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn list_messages(
        &self,
        session_id: &SessionId,
        after_sequence: u32,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        ensure_session_exists(&mut conn, session_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE session_id = $1 AND sequence > $2
             ORDER BY sequence ASC LIMIT $3"
        ))
        .bind(session_id.as_str())
        .bind(counter_to_db(after_sequence))
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    #[instrument(skip(self, new), fields(session_id = %session_id, label = %new.label))]
    async fn add_checkpoint(
        &self,
        session_id: &SessionId,
        new: NewCheckpoint,
    ) -> Result<Checkpoint, StoreError> {
        let mut tx = self.pool.begin().await?;
        let session = select_session(&mut tx, session_id, true).await?;

        let row = sqlx::query(&format!(
            "INSERT INTO checkpoints (id, session_id, sequence, label, total_turns, total_cost,
                                      message_sequence, state_snapshot)
             VALUES ($1, $2,
                     (SELECT COALESCE(MAX(sequence), 0) + 1 FROM checkpoints WHERE session_id = $2),
                     $3, $4, $5, $6, $7)
             RETURNING {CHECKPOINT_COLUMNS}"
        ))
        .bind(CheckpointId::new().as_str())
        .bind(session_id.as_str())
        .bind(&new.label)
        .bind(counter_to_db(session.total_turns))
        .bind(session.total_cost)
        .bind(counter_to_db(session.message_count))
        .bind(new.state_snapshot.as_deref())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        row_to_checkpoint(&row)
    }

    #[instrument(skip(self), fields(checkpoint_id = %id))]
    async fn get_checkpoint(&self, id: &CheckpointId) -> Result<Checkpoint, StoreError> {
        let mut conn = self.pool.acquire().await?;
        select_checkpoint(&mut conn, id).await
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    async fn list_checkpoints(&self, session_id: &SessionId) -> Result<Vec<Checkpoint>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        ensure_session_exists(&mut conn, session_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints
             WHERE session_id = $1 ORDER BY sequence ASC"
        ))
        .bind(session_id.as_str())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    #[instrument(skip(self), fields(session_id = %session_id, checkpoint_id = %checkpoint_id))]
    async fn rewind(
        &self,
        session_id: &SessionId,
        checkpoint_id: &CheckpointId,
        expected_version: Option<i64>,
    ) -> Result<Session, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock first; concurrent checkpoint writes queue behind it.
        select_session(&mut tx, session_id, true).await?;

        let checkpoint = match select_checkpoint(&mut tx, checkpoint_id).await {
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

        sqlx::query(
            "UPDATE checkpoints SET invalidated_at = NOW()
             WHERE session_id = $1 AND sequence > $2 AND invalidated_at IS NULL",
        )
        .bind(session_id.as_str())
        .bind(counter_to_db(checkpoint.sequence))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM messages WHERE session_id = $1 AND sequence > $2")
            .bind(session_id.as_str())
            .bind(counter_to_db(checkpoint.message_sequence))
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            "UPDATE sessions SET
                total_turns = $1,
                total_cost = $2,
                message_count = $3,
                status = CASE WHEN status = 'interrupted' THEN 'active' ELSE status END,
                version = version + 1,
                updated_at = NOW()
             WHERE id = $4 AND ($5::BIGINT IS NULL OR version = $5)
             RETURNING {SESSION_COLUMNS}"
        ))
        .bind(counter_to_db(checkpoint.total_turns))
        .bind(checkpoint.total_cost)
        .bind(counter_to_db(checkpoint.message_sequence))
        .bind(session_id.as_str())
        .bind(expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        let restored = match row {
            Some(row) => row_to_session(&row)?,
            None => return Err(missed_write(&mut tx, session_id, expected_version).await),
        };
        tx.commit().await?;
        Ok(restored)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

async fn select_session(
    conn: &mut PgConnection,
    id: &SessionId,
    for_update: bool,
) -> Result<Session, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1{lock}"
    ))
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => row_to_session(&row),
        None => Err(StoreError::session_not_found(id.as_str())),
    }
}

async fn ensure_session_exists(conn: &mut PgConnection, id: &SessionId) -> Result<(), StoreError> {
    let found = sqlx::query("SELECT 1 FROM sessions WHERE id = $1")
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(StoreError::session_not_found(id.as_str())),
    }
}

async fn missed_write(
    conn: &mut PgConnection,
    id: &SessionId,
    expected_version: Option<i64>,
) -> StoreError {
    match ensure_session_exists(conn, id).await {
        Err(e) => e,
        Ok(()) => StoreError::Conflict(format!(
            "session {id} is no longer at version {}",
            expected_version.unwrap_or_default()
        )),
    }
}

async fn select_checkpoint(
    conn: &mut PgConnection,
    id: &CheckpointId,
) -> Result<Checkpoint, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE id = $1"
    ))
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => row_to_checkpoint(&row),
        None => Err(StoreError::checkpoint_not_found(id.as_str())),
    }
}

/// Counters are `u32` in the domain and `INTEGER` in the schema.
fn counter_to_db(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn col<'r, T>(row: &'r PgRow, table: &'static str, column: &'static str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

fn count(row: &PgRow, table: &'static str, column: &'static str) -> Result<u32, StoreError> {
    let raw: i32 = col(row, table, column)?;
    u32::try_from(raw).map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("counter out of range: {raw}"),
    })
}

fn parse<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

fn row_to_session(row: &PgRow) -> Result<Session, StoreError> {
    let t = "sessions";
    let status: String = col(row, t, "status")?;
    Ok(Session {
        id: SessionId::from_raw(col::<String>(row, t, "id")?),
        owner_key: OwnerKey::new(col::<String>(row, t, "owner_key")?),
        model: col(row, t, "model")?,
        status: parse(&status, t, "status")?,
        parent_session_id: col::<Option<String>>(row, t, "parent_session_id")?
            .map(SessionId::from_raw),
        total_turns: count(row, t, "total_turns")?,
        total_cost: col(row, t, "total_cost")?,
        message_count: count(row, t, "message_count")?,
        working_directory: col(row, t, "working_directory")?,
        metadata: col(row, t, "metadata")?,
        version: col(row, t, "version")?,
        created_at: col::<DateTime<Utc>>(row, t, "created_at")?,
        updated_at: col::<DateTime<Utc>>(row, t, "updated_at")?,
    })
}

fn row_to_message(row: &PgRow) -> Result<Message, StoreError> {
    let t = "messages";
    let role: String = col(row, t, "role")?;
    Ok(Message {
        id: MessageId::from_raw(col::<String>(row, t, "id")?),
        session_id: SessionId::from_raw(col::<String>(row, t, "session_id")?),
        sequence: count(row, t, "sequence")?,
        role: parse(&role, t, "role")?,
        content: col(row, t, "content")?,
        created_at: col(row, t, "created_at")?,
    })
}

fn row_to_checkpoint(row: &PgRow) -> Result<Checkpoint, StoreError> {
    let t = "checkpoints";
    Ok(Checkpoint {
        id: CheckpointId::from_raw(col::<String>(row, t, "id")?),
        session_id: SessionId::from_raw(col::<String>(row, t, "session_id")?),
        sequence: count(row, t, "sequence")?,
        label: col(row, t, "label")?,
        total_turns: count(row, t, "total_turns")?,
        total_cost: col(row, t, "total_cost")?,
        message_sequence: count(row, t, "message_sequence")?,
        state_snapshot: col(row, t, "state_snapshot")?,
        created_at: col(row, t, "created_at")?,
        invalidated_at: col(row, t, "invalidated_at")?,
    })
}
