//! Translation of adapter errors into the `SessionError` taxonomy. No store or
//! cache error type crosses this boundary.

use keel_cache::CacheError;
use keel_core::{CheckpointId, SessionError, SessionId};
use keel_store::StoreError;

/// Map a store failure for an operation on `session_id` (if any).
pub(crate) fn from_store(err: StoreError, session_id: Option<&SessionId>) -> SessionError {
    match err {
        StoreError::NotFound { entity: "session", id } => SessionError::NotFound {
            session_id: SessionId::from_raw(id),
        },
        StoreError::NotFound { entity, id } => {
            SessionError::InvalidConfiguration(format!("{entity} not found: {id}"))
        }
        StoreError::AlreadyExists { entity, id } => {
            SessionError::InvalidConfiguration(format!("{entity} id {id} is already in use"))
        }
        StoreError::Conflict(_) => match session_id {
            Some(id) => SessionError::Conflict {
                session_id: id.clone(),
            },
            None => SessionError::storage(None, "unexpected version conflict"),
        },
        StoreError::CheckpointRejected {
            session_id: sid,
            checkpoint_id,
            reason,
        } => SessionError::InvalidCheckpoint {
            session_id: SessionId::from_raw(sid),
            checkpoint_id: CheckpointId::from_raw(checkpoint_id),
            reason,
        },
        StoreError::Unavailable(message) | StoreError::Database(message) => {
            SessionError::storage(session_id, message)
        }
        other @ (StoreError::CorruptRow { .. } | StoreError::Serialization(_)) => {
            SessionError::storage(session_id, other.to_string())
        }
    }
}

/// Map a failure to take the per-session lock.
pub(crate) fn from_lock(err: CacheError, session_id: &SessionId) -> SessionError {
    match err {
        CacheError::LockTimeout { waited, .. } => SessionError::LockTimeout {
            session_id: session_id.clone(),
            waited,
        },
        other => SessionError::storage(Some(session_id), format!("lock unavailable: {other}")),
    }
}
