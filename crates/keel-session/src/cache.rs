//! Best-effort cache-aside helpers. Nothing here can fail an operation: every
//! cache error is logged and treated as a miss.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use keel_cache::{CacheError, CacheKeys, CacheStore};
use keel_core::{OwnerKey, Session, SessionId};
use keel_settings::CacheSettings;

pub(crate) struct SessionCache {
    store: Option<Arc<dyn CacheStore>>,
    keys: CacheKeys,
    session_ttl: Duration,
    owner_index_ttl: Duration,
    scan_max_keys: usize,
}

impl SessionCache {
    pub(crate) fn new(store: Option<Arc<dyn CacheStore>>, settings: &CacheSettings) -> Self {
        Self {
            store,
            keys: CacheKeys::new(settings.key_prefix.clone()),
            session_ttl: settings.session_ttl(),
            owner_index_ttl: settings.owner_index_ttl(),
            scan_max_keys: settings.scan_max_keys,
        }
    }

    pub(crate) fn store(&self) -> Option<&Arc<dyn CacheStore>> {
        self.store.as_ref()
    }

    pub(crate) fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    pub(crate) fn scan_max_keys(&self) -> usize {
        self.scan_max_keys
    }

    pub(crate) async fn get(&self, id: &SessionId) -> Option<Session> {
        let store = self.store.as_ref()?;
        let key = self.keys.session(id);
        let raw = match store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(session_id = %id, "session cache miss");
                return None;
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "session cache read failed");
                return None;
            }
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => {
                debug!(session_id = %id, "session cache hit");
                Some(session)
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "dropping undecodable cache entry");
                let _ = store.delete(&key).await;
                None
            }
        }
    }

    /// Store the projection. Returns whether it landed.
    pub(crate) async fn put(&self, session: &Session) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        let raw = match serde_json::to_string(session) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "session not cacheable");
                return false;
            }
        };
        match store
            .set_ex(&self.keys.session(&session.id), &raw, self.session_ttl)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "session cache write failed");
                false
            }
        }
    }

    /// After a committed write: replace the projection, or at least make sure
    /// the stale one is gone.
    pub(crate) async fn refresh(&self, session: &Session) {
        if !self.put(session).await {
            self.evict(&session.id).await;
        }
    }

    pub(crate) async fn evict(&self, id: &SessionId) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match store.delete(&self.keys.session(id)).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(session_id = %id, error = %e, "session cache eviction failed");
                false
            }
        }
    }

    pub(crate) async fn index_owner(&self, owner: &OwnerKey, id: &SessionId) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(e) = store
            .add_to_set(&self.keys.owner_index(owner), id.as_str(), self.owner_index_ttl)
            .await
        {
            warn!(session_id = %id, error = %e, "owner index update failed");
        }
    }

    /// Cached ids for `owner`, or `None` when the index is absent or unreadable.
    pub(crate) async fn owner_members(&self, owner: &OwnerKey) -> Option<Vec<SessionId>> {
        let store = self.store.as_ref()?;
        match store
            .set_members(&self.keys.owner_index(owner), self.scan_max_keys)
            .await
        {
            Ok(members) if !members.is_empty() => {
                Some(members.into_iter().map(SessionId::from_raw).collect())
            }
            Ok(_) => None,
            Err(e) => {
                warn!(owner_key = %owner, error = %e, "owner index read failed");
                None
            }
        }
    }

    /// Bounded count of cached session projections.
    pub(crate) async fn count_sessions(&self) -> Result<Option<usize>, CacheError> {
        let Some(store) = self.store.as_ref() else {
            return Ok(None);
        };
        let keys = store
            .scan_keys(&self.keys.session_pattern(), self.scan_max_keys)
            .await?;
        Ok(Some(keys.len()))
    }

    /// Publish a pending interrupt so whichever instance applies the `done`
    /// event sees it. Returns whether the flag landed.
    pub(crate) async fn mark_interrupted(&self, id: &SessionId) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match store
            .set_ex(&self.keys.interrupt(id), "1", self.session_ttl)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %id, error = %e, "interrupt flag write failed");
                false
            }
        }
    }

    pub(crate) async fn interrupt_marked(&self, id: &SessionId) -> bool {
        let Some(store) = self.store.as_ref() else {
            return false;
        };
        match store.get(&self.keys.interrupt(id)).await {
            Ok(flag) => flag.is_some(),
            Err(e) => {
                warn!(session_id = %id, error = %e, "interrupt flag read failed");
                false
            }
        }
    }

    pub(crate) async fn clear_interrupt(&self, id: &SessionId) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if let Err(e) = store.delete(&self.keys.interrupt(id)).await {
            warn!(session_id = %id, error = %e, "interrupt flag clear failed");
        }
    }
}
