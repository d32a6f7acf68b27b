#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    /// The store could not be reached at all (pool exhausted, I/O, closed).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// Optimistic version check failed: the row changed since it was read.
    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("checkpoint {checkpoint_id} rejected for session {session_id}: {reason}")]
    CheckpointRejected {
        session_id: String,
        checkpoint_id: String,
        reason: String,
    },

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "session",
            id: id.into(),
        }
    }

    pub fn checkpoint_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "checkpoint",
            id: id.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
