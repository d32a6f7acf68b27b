use serde::{Deserialize, Serialize};

use crate::ids::{OwnerKey, SessionId};
use crate::session::NewMessage;

/// Lifecycle events pushed by the agent execution engine.
///
/// Counters are carried as absolute values rather than deltas so that a
/// redelivered event can be recognised and applied at most once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Init {
        session_id: SessionId,
        owner_key: OwnerKey,
        model: String,
        #[serde(default)]
        working_directory: Option<String>,
    },

    Turn {
        session_id: SessionId,
        /// 1-based turn number reached after this turn.
        turn: u32,
        /// Cumulative cost in USD after this turn.
        total_cost: f64,
        #[serde(default)]
        messages: Vec<NewMessage>,
    },

    Error {
        session_id: SessionId,
        message: String,
    },

    Done {
        session_id: SessionId,
        #[serde(default)]
        total_cost: Option<f64>,
        #[serde(default)]
        interrupted: bool,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Init { session_id, .. }
            | Self::Turn { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::Done { session_id, .. } => session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Turn { .. } => "turn",
            Self::Error { .. } => "error",
            Self::Done { .. } => "done",
        }
    }
}
