use std::time::Duration;

use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use rand::Rng;

use crate::error::CacheError;

/// Key-value store used for cache-aside projections, owner indexes and
/// distributed locks. Never authoritative.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Add `member` to the set at `key` and refresh the set's expiry.
    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), CacheError>;

    /// Up to `max_members` members of the set at `key`, in no particular order.
    async fn set_members(&self, key: &str, max_members: usize) -> Result<Vec<String>, CacheError>;

    /// Keys matching a glob `pattern`, at most `max_keys`. Iterates in
    /// bounded batches; callers must not assume they saw every match.
    async fn scan_keys(&self, pattern: &str, max_keys: usize) -> Result<Vec<String>, CacheError>;

    /// Set `key` to a fresh random token only if it is absent, with `ttl`, in
    /// one atomic step. `None` means someone else holds it.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>, CacheError>;

    /// Delete `key` only if it still holds `token`. Returns false when the
    /// lock expired and now belongs to another holder.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Unguessable lock token.
pub(crate) fn new_lock_token() -> String {
    format!("{:032x}", rand::thread_rng().gen::<u128>())
}

/// Compile a scan pattern with Redis `MATCH` semantics: `*` and `?` cross
/// `:` separators, `[...]` classes and `\` escapes are honoured.
pub(crate) fn key_matcher(pattern: &str) -> Result<GlobMatcher, CacheError> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| CacheError::Operation(format!("invalid scan pattern {pattern:?}: {e}")))
}
