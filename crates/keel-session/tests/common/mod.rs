#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use keel_cache::{CacheError, CacheStore, MemoryCache};
use keel_core::{OwnerKey, Session};
use keel_session::{CreateSession, SessionService};
use keel_settings::KeelSettings;
use keel_store::sqlite::{Database, SqliteSessionRepo};
use keel_store::SessionRepository;

pub fn settings() -> KeelSettings {
    let mut settings = KeelSettings::default();
    settings.lock.timeout_ms = 30_000;
    settings.lock.base_delay_ms = 2;
    settings.lock.max_delay_ms = 50;
    settings
}

pub fn repo() -> Arc<dyn SessionRepository> {
    Arc::new(SqliteSessionRepo::new(Database::in_memory().unwrap()))
}

/// Single process, no shared cache.
pub fn local_service() -> SessionService {
    SessionService::new(repo(), None, &settings())
}

/// Shared in-process cache standing in for Redis.
pub fn cached_service() -> (SessionService, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new());
    let service = SessionService::new(repo(), Some(cache.clone() as Arc<dyn CacheStore>), &settings());
    (service, cache)
}

pub async fn create(service: &SessionService, owner: &str) -> Session {
    service
        .create_session(CreateSession::new(OwnerKey::new(owner), "sonnet"))
        .await
        .unwrap()
}

/// A cache that never answers.
#[derive(Debug, Default)]
pub struct FailingCache;

fn down() -> CacheError {
    CacheError::Unavailable("connection refused".into())
}

#[async_trait]
impl CacheStore for FailingCache {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(down())
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Err(down())
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Err(down())
    }

    async fn add_to_set(&self, _key: &str, _member: &str, _ttl: Duration) -> Result<(), CacheError> {
        Err(down())
    }

    async fn remove_from_set(&self, _key: &str, _member: &str) -> Result<(), CacheError> {
        Err(down())
    }

    async fn set_members(&self, _key: &str, _max: usize) -> Result<Vec<String>, CacheError> {
        Err(down())
    }

    async fn scan_keys(&self, _pattern: &str, _max: usize) -> Result<Vec<String>, CacheError> {
        Err(down())
    }

    async fn acquire_lock(&self, _key: &str, _ttl: Duration) -> Result<Option<String>, CacheError> {
        Err(down())
    }

    async fn release_lock(&self, _key: &str, _token: &str) -> Result<bool, CacheError> {
        Err(down())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Err(down())
    }
}

/// Locks work, every data operation fails.
#[derive(Debug, Default)]
pub struct FlakyCache {
    locks: MemoryCache,
}

#[async_trait]
impl CacheStore for FlakyCache {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Timeout {
            op: "get",
            after: Duration::from_millis(250),
        })
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        Err(down())
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Err(down())
    }

    async fn add_to_set(&self, _key: &str, _member: &str, _ttl: Duration) -> Result<(), CacheError> {
        Err(down())
    }

    async fn remove_from_set(&self, _key: &str, _member: &str) -> Result<(), CacheError> {
        Err(down())
    }

    async fn set_members(&self, _key: &str, _max: usize) -> Result<Vec<String>, CacheError> {
        Err(down())
    }

    async fn scan_keys(&self, _pattern: &str, _max: usize) -> Result<Vec<String>, CacheError> {
        Err(down())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>, CacheError> {
        self.locks.acquire_lock(key, ttl).await
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        self.locks.release_lock(key, token).await
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
