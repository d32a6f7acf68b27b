use std::time::Duration;

use crate::ids::{CheckpointId, SessionId};
use crate::session::SessionStatus;

/// Errors surfaced by the session service.
///
/// Every variant is distinguishable by the transport layer and carries the
/// session id when one is known. Retryable kinds are transient contention;
/// everything else is surfaced to the caller as-is.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {session_id}")]
    NotFound { session_id: SessionId },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("timed out after {waited:?} waiting for lock on session {session_id}")]
    LockTimeout {
        session_id: SessionId,
        waited: Duration,
    },

    #[error("invalid state transition for session {session_id}: {from} -> {to}")]
    InvalidStateTransition {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("invalid checkpoint {checkpoint_id} for session {session_id}: {reason}")]
    InvalidCheckpoint {
        session_id: SessionId,
        checkpoint_id: CheckpointId,
        reason: String,
    },

    #[error("concurrent modification of session {session_id}")]
    Conflict { session_id: SessionId },

    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        session_id: Option<SessionId>,
        message: String,
    },
}

impl SessionError {
    pub fn not_found(session_id: &SessionId) -> Self {
        Self::NotFound {
            session_id: session_id.clone(),
        }
    }

    pub fn storage(session_id: Option<&SessionId>, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            session_id: session_id.cloned(),
            message: message.into(),
        }
    }

    /// Transient contention the caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Conflict { .. })
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::NotFound { session_id }
            | Self::LockTimeout { session_id, .. }
            | Self::InvalidStateTransition { session_id, .. }
            | Self::InvalidCheckpoint { session_id, .. }
            | Self::Conflict { session_id } => Some(session_id),
            Self::StorageUnavailable { session_id, .. } => session_id.as_ref(),
            Self::InvalidConfiguration(_) => None,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "session_not_found",
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::InvalidStateTransition { .. } => "invalid_state_transition",
            Self::InvalidCheckpoint { .. } => "invalid_checkpoint",
            Self::Conflict { .. } => "conflict",
            Self::StorageUnavailable { .. } => "storage_unavailable",
        }
    }
}
