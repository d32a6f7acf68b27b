//! The session service: single entry point for session state transitions.
//!
//! Reads are cache-aside. Writes take the per-session lock, read the
//! authoritative row from the store, apply the caller's mutator, write back
//! with a version check, refresh the cache, then release the lock.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use keel_cache::{CacheStore, LockMode, SessionLease, SessionLockManager};
use keel_core::{Message, NewMessage, OwnerKey, Session, SessionError, SessionId, SessionStatus};
use keel_settings::{KeelSettings, SessionSettings};
use keel_store::{ListSessionsQuery, NewSession, SessionPage, SessionPatch, SessionRepository, StoreError};

use crate::cache::SessionCache;
use crate::errors::{from_lock, from_store};
use crate::interrupts::InterruptRegistry;

/// Arguments for [`SessionService::create_session`].
#[derive(Clone, Debug)]
pub struct CreateSession {
    pub owner_key: OwnerKey,
    pub model: String,
    /// Client-chosen id; a fresh one is generated when absent.
    pub session_id: Option<String>,
    pub parent_session_id: Option<SessionId>,
    pub working_directory: Option<String>,
    pub metadata: serde_json::Value,
}

impl CreateSession {
    pub fn new(owner_key: OwnerKey, model: impl Into<String>) -> Self {
        Self {
            owner_key,
            model: model.into(),
            session_id: None,
            parent_session_id: None,
            working_directory: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_parent(mut self, parent: SessionId) -> Self {
        self.parent_session_id = Some(parent);
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Overrides for [`SessionService::fork_session`]. Unset fields inherit from
/// the parent.
#[derive(Clone, Debug, Default)]
pub struct ForkOptions {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub working_directory: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Optional filters for [`SessionService::list_sessions`].
#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
    /// 1-based; defaults to 1.
    pub page: Option<u32>,
    /// Defaults to `session.defaultPageSize`, capped at `session.maxPageSize`.
    pub page_size: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Shared cache reachable; locks are fleet-wide.
    Distributed,
    /// Running without a shared cache; locks are in-process.
    Degraded,
    /// A shared cache is configured but not answering.
    Unreachable,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub store_backend: &'static str,
    pub store_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub cache_mode: CacheMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_error: Option<String>,
    pub lock_mode: &'static str,
    /// Cached session projections seen by a bounded scan.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_sessions: Option<usize>,
}

impl HealthReport {
    /// The store is the only hard dependency.
    pub fn is_healthy(&self) -> bool {
        self.store_ok
    }
}

pub struct SessionService {
    pub(crate) repo: Arc<dyn SessionRepository>,
    pub(crate) cache: SessionCache,
    pub(crate) locks: SessionLockManager,
    pub(crate) interrupts: InterruptRegistry,
    pub(crate) settings: SessionSettings,
}

impl fmt::Debug for SessionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionService")
            .field("store", &self.repo.backend())
            .field("cache", &self.cache.store().map(|c| c.name()))
            .field("lock_mode", &self.locks.mode())
            .finish_non_exhaustive()
    }
}

impl SessionService {
    /// Wire the service from explicit dependencies. With a cache, locks live
    /// in it; without one, the service runs single-process with local locks.
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        cache: Option<Arc<dyn CacheStore>>,
        settings: &KeelSettings,
    ) -> Self {
        let cache = SessionCache::new(cache, &settings.cache);
        let locks = match cache.store() {
            Some(store) => SessionLockManager::distributed(
                Arc::clone(store),
                cache.keys().clone(),
                &settings.lock,
            ),
            None => SessionLockManager::local(&settings.lock),
        };
        Self {
            repo,
            cache,
            locks,
            interrupts: InterruptRegistry::new(),
            settings: settings.session.clone(),
        }
    }

    /// Like [`SessionService::new`], but probe the cache first. An unreachable
    /// cache degrades to single-process mode unless `cache.required` is set.
    pub async fn start(
        repo: Arc<dyn SessionRepository>,
        cache: Option<Arc<dyn CacheStore>>,
        settings: &KeelSettings,
    ) -> Result<Self, SessionError> {
        let cache = match cache {
            Some(store) => match store.ping().await {
                Ok(()) => Some(store),
                Err(e) if settings.cache.required => {
                    return Err(SessionError::storage(
                        None,
                        format!("cache required but unreachable: {e}"),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "cache unreachable, running single-process without it");
                    None
                }
            },
            None => None,
        };
        let service = Self::new(repo, cache, settings);
        info!(
            store = service.repo.backend(),
            lock_mode = service.locks.mode().as_str(),
            "session service started"
        );
        Ok(service)
    }

    pub fn lock_mode(&self) -> LockMode {
        self.locks.mode()
    }

    pub fn repository(&self) -> &Arc<dyn SessionRepository> {
        &self.repo
    }

    #[instrument(skip(self, request), fields(owner_key = %request.owner_key, model = %request.model))]
    pub async fn create_session(&self, request: CreateSession) -> Result<Session, SessionError> {
        if request.model.trim().is_empty() {
            return Err(SessionError::InvalidConfiguration("model must not be empty".into()));
        }
        if request.owner_key.as_str().is_empty() {
            return Err(SessionError::InvalidConfiguration("owner key must not be empty".into()));
        }
        let id = match request.session_id {
            Some(raw) if !SessionId::is_well_formed(&raw) => {
                return Err(SessionError::InvalidConfiguration(format!(
                    "malformed session id: {raw:?}"
                )));
            }
            Some(raw) => SessionId::from_raw(raw),
            None => SessionId::new(),
        };

        if let Some(parent_id) = &request.parent_session_id {
            let parent = self.repo.get(parent_id).await.map_err(|e| match e {
                StoreError::NotFound { .. } => SessionError::InvalidConfiguration(format!(
                    "parent session {parent_id} does not exist"
                )),
                other => from_store(other, Some(&id)),
            })?;
            if parent.owner_key != request.owner_key {
                return Err(SessionError::InvalidConfiguration(format!(
                    "parent session {parent_id} belongs to another owner"
                )));
            }
        }

        let session = self
            .repo
            .create(NewSession {
                id: id.clone(),
                owner_key: request.owner_key,
                model: request.model,
                parent_session_id: request.parent_session_id,
                working_directory: request.working_directory,
                metadata: request.metadata,
            })
            .await
            .map_err(|e| from_store(e, Some(&id)))?;

        self.cache.put(&session).await;
        self.cache.index_owner(&session.owner_key, &session.id).await;
        info!(session_id = %session.id, "session created");
        Ok(session)
    }

    /// Cache-aside read. The cached projection may trail the store by up to
    /// the cache TTL if a refresh was lost.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn get_session(&self, session_id: &SessionId) -> Result<Session, SessionError> {
        if let Some(cached) = self.cache.get(session_id).await {
            return Ok(cached);
        }
        let session = self
            .repo
            .get(session_id)
            .await
            .map_err(|e| from_store(e, Some(session_id)))?;
        self.cache.put(&session).await;
        Ok(session)
    }

    /// Serialised read-modify-write. The mutator sees the authoritative row
    /// and may be invoked more than once if the row changes underneath.
    #[instrument(skip(self, mutator), fields(session_id = %session_id))]
    pub async fn update_session<F>(
        &self,
        session_id: &SessionId,
        mut mutator: F,
    ) -> Result<Session, SessionError>
    where
        F: FnMut(&mut Session) -> Result<(), SessionError> + Send,
    {
        let lease = self.lock(session_id).await?;
        let result = self.apply_locked(session_id, &mut mutator).await;
        if let Ok(session) = &result {
            self.cache.refresh(session).await;
            if session.status.is_terminal() {
                self.forget_interrupt(session_id).await;
            }
        }
        self.unlock(lease).await;
        result
    }

    #[instrument(skip(self, filter), fields(owner_key = %owner_key))]
    pub async fn list_sessions(
        &self,
        owner_key: &OwnerKey,
        filter: SessionFilter,
    ) -> Result<SessionPage, SessionError> {
        let page_size = filter
            .page_size
            .unwrap_or(self.settings.default_page_size)
            .clamp(1, self.settings.max_page_size.max(1));
        let query = ListSessionsQuery {
            owner_key: owner_key.clone(),
            status: filter.status,
            created_after: filter.created_after,
            created_before: filter.created_before,
            page: filter.page.unwrap_or(1).max(1),
            page_size,
        };
        self.repo.list(&query).await.map_err(|e| from_store(e, None))
    }

    /// New session branching from `parent_id`; the parent is not modified.
    #[instrument(skip(self, options), fields(parent_id = %parent_id))]
    pub async fn fork_session(
        &self,
        parent_id: &SessionId,
        options: ForkOptions,
    ) -> Result<Session, SessionError> {
        let parent = self
            .repo
            .get(parent_id)
            .await
            .map_err(|e| from_store(e, Some(parent_id)))?;

        let mut request = CreateSession::new(
            parent.owner_key.clone(),
            options.model.unwrap_or_else(|| parent.model.clone()),
        )
        .with_parent(parent.id.clone())
        .with_metadata(options.metadata.unwrap_or_else(|| parent.metadata.clone()));
        request.session_id = options.session_id;
        request.working_directory = options.working_directory.or(parent.working_directory);

        self.create_session(request).await
    }

    /// Append a message. Ordering comes from the store transaction that
    /// allocates the sequence number, so no session lock is taken.
    #[instrument(skip(self, message), fields(session_id = %session_id, role = %message.role))]
    pub async fn append_message(
        &self,
        session_id: &SessionId,
        message: NewMessage,
    ) -> Result<Message, SessionError> {
        let message = self
            .repo
            .add_message(session_id, message)
            .await
            .map_err(|e| from_store(e, Some(session_id)))?;
        // The cached projection carries message_count.
        self.cache.evict(session_id).await;
        Ok(message)
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn list_messages(
        &self,
        session_id: &SessionId,
        after_sequence: u32,
        limit: u32,
    ) -> Result<Vec<Message>, SessionError> {
        let limit = limit.clamp(1, self.settings.max_page_size.max(1));
        self.repo
            .list_messages(session_id, after_sequence, limit)
            .await
            .map_err(|e| from_store(e, Some(session_id)))
    }

    /// Session ids owned by `owner_key`, from the cached owner index when
    /// present, else from the store (re-populating the index). Bounded by
    /// `cache.scanMaxKeys`; order is unspecified.
    #[instrument(skip(self), fields(owner_key = %owner_key))]
    pub async fn owned_session_ids(&self, owner_key: &OwnerKey) -> Result<Vec<SessionId>, SessionError> {
        if let Some(ids) = self.cache.owner_members(owner_key).await {
            return Ok(ids);
        }
        let limit = u32::try_from(self.cache.scan_max_keys()).unwrap_or(u32::MAX);
        let ids = self
            .repo
            .list_ids_by_owner(owner_key, limit)
            .await
            .map_err(|e| from_store(e, None))?;
        for id in &ids {
            self.cache.index_owner(owner_key, id).await;
        }
        Ok(ids)
    }

    /// Drop the cached projection. Returns whether one was present.
    pub async fn evict(&self, session_id: &SessionId) -> bool {
        self.cache.evict(session_id).await
    }

    /// Token the engine watches while running `session_id`. Only active
    /// sessions get one.
    pub async fn interrupt_token(&self, session_id: &SessionId) -> Result<CancellationToken, SessionError> {
        let session = self
            .repo
            .get(session_id)
            .await
            .map_err(|e| from_store(e, Some(session_id)))?;
        if session.status.is_terminal() {
            return Err(SessionError::InvalidStateTransition {
                session_id: session_id.clone(),
                from: session.status,
                to: SessionStatus::Active,
            });
        }
        let token = self.interrupts.token(session_id);
        if self.cache.interrupt_marked(session_id).await {
            // Requested through another instance before the engine got here.
            token.cancel();
        }
        Ok(token)
    }

    /// Signal the engine running `session_id` to stop. The next `done` event,
    /// on any instance sharing the cache, finalises the session as
    /// `interrupted`. Returns `false` when the session is already terminal or
    /// was interrupted before.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn interrupt(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        let session = self
            .repo
            .get(session_id)
            .await
            .map_err(|e| from_store(e, Some(session_id)))?;
        if session.status.is_terminal() {
            debug!(status = %session.status, "interrupt ignored");
            return Ok(false);
        }
        let was_live = self.interrupts.interrupt(session_id);
        self.cache.mark_interrupted(session_id).await;
        Ok(was_live)
    }

    pub async fn is_interrupted(&self, session_id: &SessionId) -> bool {
        self.interrupts.is_interrupted(session_id) || self.cache.interrupt_marked(session_id).await
    }

    /// Sessions with a registered interrupt token on this instance.
    pub fn pending_interrupts(&self) -> usize {
        self.interrupts.len()
    }

    pub(crate) async fn forget_interrupt(&self, session_id: &SessionId) {
        self.interrupts.clear(session_id);
        self.cache.clear_interrupt(session_id).await;
    }

    pub async fn health(&self) -> HealthReport {
        let store = self.repo.ping().await;
        let (cache_mode, cached_sessions, cache_error) = match self.cache.store() {
            None => (CacheMode::Degraded, None, None),
            Some(store) => match store.ping().await {
                Err(e) => (CacheMode::Unreachable, None, Some(e.to_string())),
                Ok(()) => match self.cache.count_sessions().await {
                    Ok(count) => (CacheMode::Distributed, count, None),
                    Err(e) => (CacheMode::Distributed, None, Some(e.to_string())),
                },
            },
        };
        HealthReport {
            store_backend: self.repo.backend(),
            store_ok: store.is_ok(),
            store_error: store.err().map(|e| e.to_string()),
            cache_mode,
            cache_error,
            lock_mode: self.locks.mode().as_str(),
            cached_sessions,
        }
    }

    pub(crate) async fn lock(&self, session_id: &SessionId) -> Result<SessionLease, SessionError> {
        self.locks
            .acquire(session_id)
            .await
            .map_err(|e| from_lock(e, session_id))
    }

    pub(crate) async fn unlock(&self, lease: SessionLease) {
        let session_id = lease.session_id().clone();
        if !lease.release().await {
            debug!(session_id = %session_id, "lease was not released cleanly");
        }
    }

    /// Read, mutate, and conditionally write. Caller holds the lock; the
    /// version check catches writers that bypassed it.
    pub(crate) async fn apply_locked<F>(
        &self,
        session_id: &SessionId,
        mutator: &mut F,
    ) -> Result<Session, SessionError>
    where
        F: FnMut(&mut Session) -> Result<(), SessionError> + Send,
    {
        let attempts = self.settings.max_update_retries.saturating_add(1);
        for attempt in 0..attempts {
            let current = self
                .repo
                .get(session_id)
                .await
                .map_err(|e| from_store(e, Some(session_id)))?;

            let mut next = current.clone();
            mutator(&mut next)?;
            check_mutation(&current, &next)?;

            let patch = SessionPatch::diff(&current, &next);
            if patch.is_empty() {
                return Ok(current);
            }
            match self.repo.update(session_id, &patch, Some(current.version)).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::Conflict(detail)) => {
                    debug!(session_id = %session_id, attempt, %detail, "version conflict, retrying");
                }
                Err(e) => return Err(from_store(e, Some(session_id))),
            }
        }
        warn!(session_id = %session_id, attempts, "update kept losing version checks");
        Err(SessionError::Conflict {
            session_id: session_id.clone(),
        })
    }
}

/// Reject mutations of store-managed or immutable fields, decreasing
/// counters, and illegal status moves.
pub(crate) fn check_mutation(before: &Session, after: &Session) -> Result<(), SessionError> {
    let immutable = |field: &str| {
        SessionError::InvalidConfiguration(format!("session field {field} cannot be changed"))
    };
    if after.id != before.id {
        return Err(immutable("id"));
    }
    if after.owner_key != before.owner_key {
        return Err(immutable("owner_key"));
    }
    if after.model != before.model {
        return Err(immutable("model"));
    }
    if after.parent_session_id != before.parent_session_id {
        return Err(immutable("parent_session_id"));
    }
    if after.created_at != before.created_at {
        return Err(immutable("created_at"));
    }
    if after.version != before.version {
        return Err(immutable("version"));
    }
    if after.message_count != before.message_count {
        return Err(immutable("message_count"));
    }
    if after.working_directory.is_none() && before.working_directory.is_some() {
        return Err(immutable("working_directory (it can be replaced, not cleared)"));
    }
    if after.total_turns < before.total_turns {
        return Err(SessionError::InvalidConfiguration(format!(
            "total_turns cannot decrease ({} -> {})",
            before.total_turns, after.total_turns
        )));
    }
    if after.total_cost.is_nan() || after.total_cost < before.total_cost {
        return Err(SessionError::InvalidConfiguration(format!(
            "total_cost cannot decrease ({} -> {})",
            before.total_cost, after.total_cost
        )));
    }
    if !before.status.can_transition_to(after.status) {
        return Err(SessionError::InvalidStateTransition {
            session_id: before.id.clone(),
            from: before.status,
            to: after.status,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn session(status: SessionStatus) -> Session {
        let now = Utc::now();
        Session {
            id: SessionId::from_raw("s1"),
            owner_key: OwnerKey::new("alice"),
            model: "sonnet".into(),
            status,
            parent_session_id: None,
            total_turns: 2,
            total_cost: 0.5,
            message_count: 4,
            working_directory: Some("/w".into()),
            metadata: serde_json::json!({}),
            version: 3,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn counters_may_grow() {
        let before = session(SessionStatus::Active);
        let mut after = before.clone();
        after.total_turns = 3;
        after.total_cost = 0.75;
        check_mutation(&before, &after).unwrap();
    }

    #[test]
    fn counters_may_not_shrink() {
        let before = session(SessionStatus::Active);
        let mut after = before.clone();
        after.total_turns = 1;
        assert_matches!(check_mutation(&before, &after), Err(SessionError::InvalidConfiguration(_)));

        let mut after = before.clone();
        after.total_cost = f64::NAN;
        assert_matches!(check_mutation(&before, &after), Err(SessionError::InvalidConfiguration(_)));
    }

    #[test]
    fn immutable_fields_rejected() {
        let before = session(SessionStatus::Active);
        let mut after = before.clone();
        after.model = "opus".into();
        assert_matches!(check_mutation(&before, &after), Err(SessionError::InvalidConfiguration(m)) if m.contains("model"));

        let mut after = before.clone();
        after.owner_key = OwnerKey::new("mallory");
        assert_matches!(check_mutation(&before, &after), Err(SessionError::InvalidConfiguration(_)));

        let mut after = before.clone();
        after.working_directory = None;
        assert_matches!(check_mutation(&before, &after), Err(SessionError::InvalidConfiguration(_)));
    }

    #[test]
    fn terminal_status_cannot_reactivate() {
        for terminal in [SessionStatus::Completed, SessionStatus::Error, SessionStatus::Interrupted] {
            let before = session(terminal);
            let mut after = before.clone();
            after.status = SessionStatus::Active;
            assert_matches!(
                check_mutation(&before, &after),
                Err(SessionError::InvalidStateTransition { from, to: SessionStatus::Active, .. }) if from == terminal
            );
        }
    }

    #[test]
    fn terminal_bookkeeping_allowed() {
        let before = session(SessionStatus::Completed);
        let mut after = before.clone();
        after.total_cost = 0.9;
        after.metadata = serde_json::json!({"invoice": "inv-1"});
        check_mutation(&before, &after).unwrap();
    }
}
