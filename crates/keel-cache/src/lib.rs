//! # keel-cache
//!
//! Cache/lock adapter for the session service.
//!
//! - [`CacheStore`]: get/set/delete with TTL, bounded set and key scans, and
//!   the atomic lock primitive (set-if-absent with TTL, compare-and-delete
//!   release)
//! - [`RedisCache`]: the shared adapter used across instances
//! - [`MemoryCache`]: in-process adapter for single-instance runs and tests
//! - [`SessionLockManager`]: per-session locks with exponential backoff,
//!   distributed or in-process

#![deny(unsafe_code)]

pub mod error;
pub mod keys;
pub mod lock;
pub mod memory;
pub mod redis_cache;
pub mod store;

pub use error::CacheError;
pub use keys::CacheKeys;
pub use lock::{BackoffPolicy, LockMode, SessionLease, SessionLockManager};
pub use memory::MemoryCache;
pub use redis_cache::RedisCache;
pub use store::CacheStore;
