use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keel_core::SessionId;

/// Interrupt signals shared between the transport layer (which sets them) and
/// the execution engine (which watches them).
#[derive(Debug, Default)]
pub struct InterruptRegistry {
    tokens: DashMap<SessionId, CancellationToken>,
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token the engine should watch while running `session_id`.
    pub fn token(&self, session_id: &SessionId) -> CancellationToken {
        self.tokens.entry(session_id.clone()).or_default().clone()
    }

    /// Signal an interrupt. Recorded even if the engine has not asked for a
    /// token yet. Returns whether a live token was cancelled.
    pub fn interrupt(&self, session_id: &SessionId) -> bool {
        let token = self.tokens.entry(session_id.clone()).or_default();
        let was_live = !token.is_cancelled();
        token.cancel();
        if was_live {
            warn!(session_id = %session_id, "interrupt requested");
        }
        was_live
    }

    pub fn is_interrupted(&self, session_id: &SessionId) -> bool {
        self.tokens
            .get(session_id)
            .is_some_and(|t| t.is_cancelled())
    }

    /// Forget the session's token once its run is finalised or rewound.
    pub fn clear(&self, session_id: &SessionId) {
        if self.tokens.remove(session_id).is_some() {
            debug!(session_id = %session_id, "interrupt token cleared");
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
