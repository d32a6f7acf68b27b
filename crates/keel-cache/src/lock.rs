//! Per-session mutual exclusion.
//!
//! With a shared cache the lock lives in the cache (`SET NX PX` plus a
//! compare-and-delete release) so every instance honours it. Without one, a
//! single process falls back to an in-process table of async mutexes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use keel_core::SessionId;
use keel_settings::LockSettings;

use crate::error::CacheError;
use crate::keys::CacheKeys;
use crate::store::CacheStore;

/// Exponential backoff with jitter for contended lock acquisition.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Overall ceiling on waiting.
    pub timeout: Duration,
    pub jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &LockSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            timeout: Duration::from_millis(settings.timeout_ms),
            jitter_factor: settings.jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `max_delay`, then spread by `± jitter_factor`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp_ms = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let capped = exp_ms.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&LockSettings::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Lock keys in the shared cache; fleet-wide exclusion.
    Distributed,
    /// In-process mutex table; exclusion within this process only.
    Local,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Distributed => "distributed",
            Self::Local => "local",
        }
    }
}

#[derive(Default)]
struct LocalLocks {
    locks: Mutex<HashMap<SessionId, Weak<AsyncMutex<()>>>>,
}

impl LocalLocks {
    fn handle(&self, session_id: &SessionId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();

        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(session_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(AsyncMutex::new(()));
        let _ = locks.insert(session_id.clone(), Arc::downgrade(&lock));
        lock
    }

    fn tracked(&self) -> usize {
        self.locks.lock().values().filter(|w| w.strong_count() > 0).count()
    }
}

enum Backend {
    Distributed {
        cache: Arc<dyn CacheStore>,
        keys: CacheKeys,
    },
    Local(LocalLocks),
}

pub struct SessionLockManager {
    backend: Backend,
    ttl: Duration,
    policy: BackoffPolicy,
}

impl SessionLockManager {
    pub fn distributed(cache: Arc<dyn CacheStore>, keys: CacheKeys, settings: &LockSettings) -> Self {
        Self {
            backend: Backend::Distributed { cache, keys },
            ttl: Duration::from_millis(settings.ttl_ms),
            policy: BackoffPolicy::from_settings(settings),
        }
    }

    pub fn local(settings: &LockSettings) -> Self {
        Self {
            backend: Backend::Local(LocalLocks::default()),
            ttl: Duration::from_millis(settings.ttl_ms),
            policy: BackoffPolicy::from_settings(settings),
        }
    }

    pub fn mode(&self) -> LockMode {
        match self.backend {
            Backend::Distributed { .. } => LockMode::Distributed,
            Backend::Local(_) => LockMode::Local,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Local locks currently held or awaited; always 0 in distributed mode.
    pub fn local_lock_count(&self) -> usize {
        match &self.backend {
            Backend::Local(local) => local.tracked(),
            Backend::Distributed { .. } => 0,
        }
    }

    /// Wait for exclusive access to `session_id`, giving up after the
    /// policy's timeout with `CacheError::LockTimeout`.
    #[instrument(skip(self), fields(session_id = %session_id, mode = self.mode().as_str()))]
    pub async fn acquire(&self, session_id: &SessionId) -> Result<SessionLease, CacheError> {
        let started = Instant::now();
        let held = match &self.backend {
            Backend::Distributed { cache, keys } => {
                let key = keys.lock(session_id);
                let token = self.acquire_distributed(cache.as_ref(), &key, started).await?;
                Held::Distributed {
                    cache: Arc::clone(cache),
                    key,
                    token,
                }
            }
            Backend::Local(local) => {
                let lock = local.handle(session_id);
                match tokio::time::timeout(self.policy.timeout, lock.lock_owned()).await {
                    Ok(guard) => Held::Local(guard),
                    Err(_) => {
                        return Err(CacheError::LockTimeout {
                            key: session_id.to_string(),
                            waited: started.elapsed(),
                        });
                    }
                }
            }
        };
        debug!(waited_ms = started.elapsed().as_millis() as u64, "session lock acquired");
        Ok(SessionLease {
            session_id: session_id.clone(),
            held: Some(held),
            acquired_at: Instant::now(),
        })
    }

    async fn acquire_distributed(
        &self,
        cache: &dyn CacheStore,
        key: &str,
        started: Instant,
    ) -> Result<String, CacheError> {
        let deadline = started + self.policy.timeout;
        let mut attempt = 0u32;
        loop {
            match cache.acquire_lock(key, self.ttl).await {
                Ok(Some(token)) => return Ok(token),
                Ok(None) => {}
                Err(e) => warn!(key, attempt, error = %e, "lock attempt failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(key, attempts = attempt + 1, "gave up waiting for session lock");
                return Err(CacheError::LockTimeout {
                    key: key.to_string(),
                    waited: now - started,
                });
            }
            let delay = self.policy.delay(attempt).min(deadline - now);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

enum Held {
    Distributed {
        cache: Arc<dyn CacheStore>,
        key: String,
        token: String,
    },
    Local(OwnedMutexGuard<()>),
}

/// Exclusive hold on one session. Call [`SessionLease::release`] when done;
/// a dropped lease releases in the background (distributed) or immediately
/// (local).
pub struct SessionLease {
    session_id: SessionId,
    held: Option<Held>,
    acquired_at: Instant,
}

impl SessionLease {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Give the lock back. Returns false if the distributed lock had already
    /// expired and was taken by someone else, or the release could not reach
    /// the cache (the TTL then frees it).
    pub async fn release(mut self) -> bool {
        match self.held.take() {
            Some(Held::Distributed { cache, key, token }) => {
                match cache.release_lock(&key, &token).await {
                    Ok(true) => true,
                    Ok(false) => {
                        warn!(
                            session_id = %self.session_id,
                            held_ms = self.held_for().as_millis() as u64,
                            "lock expired before release"
                        );
                        false
                    }
                    Err(e) => {
                        warn!(session_id = %self.session_id, error = %e, "lock release failed");
                        false
                    }
                }
            }
            Some(Held::Local(guard)) => {
                drop(guard);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match &self.held {
            Some(Held::Distributed { .. }) => "distributed",
            Some(Held::Local(_)) => "local",
            None => "released",
        };
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .field("mode", &mode)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(Held::Distributed { cache, key, token }) = self.held.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let _ = handle.spawn(async move {
                    let _ = cache.release_lock(&key, &token).await;
                });
            }
        }
    }
}
