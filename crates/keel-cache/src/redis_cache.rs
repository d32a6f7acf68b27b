//! Redis adapter. One multiplexed `ConnectionManager` per process; every
//! command is bounded by `op_timeout` so a stalled server degrades to a
//! cache miss instead of a hung request.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use tracing::{debug, info, instrument};

use crate::error::CacheError;
use crate::store::{new_lock_token, CacheStore};

/// Compare-and-delete: only the holder presenting the stored token may release.
const RELEASE_LOCK_LUA: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Keys requested per SCAN/SSCAN round trip.
const SCAN_BATCH: usize = 100;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    op_timeout: Duration,
    release_script: Script,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisCache {
    /// Connect and verify the server answers. The URL may carry credentials,
    /// so it is never logged.
    #[instrument(skip(url))]
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| CacheError::Timeout {
                op: "connect",
                after: CONNECT_TIMEOUT,
            })??;

        let cache = Self {
            conn,
            op_timeout,
            release_script: Script::new(RELEASE_LOCK_LUA),
        };
        cache.ping().await?;
        info!(op_timeout_ms = op_timeout.as_millis() as u64, "redis cache connected");
        Ok(cache)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout {
                op,
                after: self.op_timeout,
            }),
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = self
            .bounded("get", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = self
            .bounded(
                "set",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .bounded("del", redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = self
            .bounded(
                "sadd",
                redis::pipe()
                    .atomic()
                    .cmd("SADD")
                    .arg(key)
                    .arg(member)
                    .ignore()
                    .cmd("PEXPIRE")
                    .arg(key)
                    .arg(millis(ttl))
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .bounded("srem", redis::cmd("SREM").arg(key).arg(member).query_async(&mut conn))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_members(&self, key: &str, max_members: usize) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let mut members = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "sscan",
                    redis::cmd("SSCAN")
                        .arg(key)
                        .arg(cursor)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            members.extend(batch);
            if next == 0 || members.len() >= max_members {
                break;
            }
            cursor = next;
        }
        Ok(members.into_iter().take(max_members).collect())
    }

    #[instrument(skip(self))]
    async fn scan_keys(&self, pattern: &str, max_keys: usize) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        // SCAN may return a key more than once across batches.
        let mut keys = BTreeSet::new();
        let mut cursor: u64 = 0;
        let mut rounds = 0u32;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .bounded(
                    "scan",
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            rounds += 1;
            if next == 0 || keys.len() >= max_keys {
                break;
            }
            cursor = next;
        }
        debug!(rounds, found = keys.len(), "scan finished");
        Ok(keys.into_iter().take(max_keys).collect())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let token = new_lock_token();
        let reply: Option<String> = self
            .bounded(
                "lock",
                redis::cmd("SET")
                    .arg(key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.map(|_| token))
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .bounded(
                "unlock",
                self.release_script.key(key).arg(token).invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = self
            .bounded("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}
