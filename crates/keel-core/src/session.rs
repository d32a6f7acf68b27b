use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CheckpointId, MessageId, OwnerKey, SessionId};

/// Lifecycle status of a session.
///
/// `Active` is the only non-terminal state. Terminal states accept
/// bookkeeping updates but never move again, except through a rewind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Whether a mutation may move a session from `self` to `next`.
    /// Staying put is always allowed.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        *self == next || (*self == Self::Active && next.is_terminal())
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

/// Authoritative record of one conversation with the agent execution engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub owner_key: OwnerKey,
    pub model: String,
    pub status: SessionStatus,
    /// Weak back-reference to the session this one was forked from.
    pub parent_session_id: Option<SessionId>,
    pub total_turns: u32,
    /// Accumulated cost in USD.
    pub total_cost: f64,
    pub message_count: u32,
    pub working_directory: Option<String>,
    pub metadata: serde_json::Value,
    /// Row version, bumped by every store-level update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// A message as reported by the engine, before it gets a sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: serde_json::Value,
}

impl NewMessage {
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: serde_json::Value::String(text.into()),
        }
    }
}

/// Ordered entry owned by exactly one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    /// 1-based position within the session.
    pub sequence: u32,
    pub role: MessageRole,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Named restore point capturing a session's counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub session_id: SessionId,
    /// 1-based creation order within the session.
    pub sequence: u32,
    pub label: String,
    pub total_turns: u32,
    pub total_cost: f64,
    /// Number of messages the session held when the checkpoint was taken.
    pub message_sequence: u32,
    /// Opaque marker for external state (file system, tool state).
    pub state_snapshot: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when a rewind to an earlier checkpoint discarded this one.
    pub invalidated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn is_valid(&self) -> bool {
        self.invalidated_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionStatus; 4] = [
        SessionStatus::Active,
        SessionStatus::Completed,
        SessionStatus::Error,
        SessionStatus::Interrupted,
    ];

    #[test]
    fn active_reaches_every_terminal_state() {
        for next in ALL {
            assert!(SessionStatus::Active.can_transition_to(next), "active -> {next}");
        }
    }

    #[test]
    fn terminal_states_are_closed() {
        for from in ALL.into_iter().filter(SessionStatus::is_terminal) {
            assert!(!from.can_transition_to(SessionStatus::Active), "{from} -> active");
            for to in ALL.into_iter().filter(|s| *s != from) {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
            assert!(from.can_transition_to(from));
        }
    }

    #[test]
    fn status_string_roundtrip() {
        for s in ALL {
            assert_eq!(s.as_str().parse::<SessionStatus>().unwrap(), s);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Interrupted).unwrap();
        assert_eq!(json, "\"interrupted\"");
    }

    #[test]
    fn role_parse() {
        assert_eq!("assistant".parse::<MessageRole>().unwrap(), MessageRole::Assistant);
        assert!("robot".parse::<MessageRole>().is_err());
    }

    #[test]
    fn new_message_text() {
        let msg = NewMessage::text(MessageRole::User, "hi");
        assert_eq!(msg.content, serde_json::json!("hi"));
    }
}
