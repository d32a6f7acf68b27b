//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! partial settings file only needs the fields it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeelSettings {
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub lock: LockSettings,
    pub session: SessionSettings,
    pub logging: LoggingSettings,
}

impl KeelSettings {
    /// Clamp out-of-range values and correct invalid invariants.
    ///
    /// Called automatically during loading. Bad values are corrected with a
    /// warning rather than rejected.
    pub fn validate(&mut self) {
        let lock = &mut self.lock;
        if !(0.0..=1.0).contains(&lock.jitter_factor) {
            let clamped = lock.jitter_factor.clamp(0.0, 1.0);
            tracing::warn!("lock.jitterFactor out of range ({}), clamped to {clamped}", lock.jitter_factor);
            lock.jitter_factor = clamped;
        }
        if lock.base_delay_ms == 0 {
            tracing::warn!("lock.baseDelayMs must be positive, using 1");
            lock.base_delay_ms = 1;
        }
        if lock.max_delay_ms < lock.base_delay_ms {
            tracing::warn!(
                "lock.maxDelayMs ({}) below baseDelayMs ({}), raising",
                lock.max_delay_ms,
                lock.base_delay_ms
            );
            lock.max_delay_ms = lock.base_delay_ms;
        }

        let session = &mut self.session;
        if session.max_page_size == 0 {
            tracing::warn!("session.maxPageSize must be positive, using 100");
            session.max_page_size = 100;
        }
        if session.default_page_size == 0 || session.default_page_size > session.max_page_size {
            let corrected = session.default_page_size.clamp(1, session.max_page_size);
            tracing::warn!(
                "session.defaultPageSize ({}) out of range, using {corrected}",
                session.default_page_size
            );
            session.default_page_size = corrected;
        }

        if self.database.max_connections == 0 {
            tracing::warn!("database.maxConnections must be positive, using 1");
            self.database.max_connections = 1;
        }
    }
}

/// Persistent store connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// `sqlite://<path>`, `sqlite::memory:`, or `postgres://…`.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: format!("sqlite://{}", keel_home().join("keel.db").display()),
            max_connections: 10,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Cache/lock store connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Redis URL. Absent means single-process mode with no shared cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Fail startup instead of degrading when the cache is unreachable.
    pub required: bool,
    pub key_prefix: String,
    pub session_ttl_secs: u64,
    pub owner_index_ttl_secs: u64,
    /// Ceiling for bounded key scans and owner-index reads.
    pub scan_max_keys: usize,
    /// Per-command timeout for cache round-trips.
    pub op_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            url: None,
            required: false,
            key_prefix: "keel".to_string(),
            session_ttl_secs: 3_600,
            owner_index_ttl_secs: 86_400,
            scan_max_keys: 1_000,
            op_timeout_ms: 250,
        }
    }
}

impl CacheSettings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn owner_index_ttl(&self) -> Duration {
        Duration::from_secs(self.owner_index_ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// Per-session lock acquisition policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    pub ttl_ms: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Overall ceiling on waiting for a contended lock.
    pub timeout_ms: u64,
    pub jitter_factor: f64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            base_delay_ms: 10,
            max_delay_ms: 500,
            timeout_ms: 5_000,
            jitter_factor: 0.2,
        }
    }
}

/// Session service behaviour.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub max_page_size: u32,
    pub default_page_size: u32,
    /// Re-read/re-apply attempts after an optimistic version conflict.
    pub max_update_retries: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_page_size: 100,
            default_page_size: 20,
            max_update_retries: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// JSON lines on stdout; `false` gives human-readable output.
    pub json: bool,
    /// Per-module level overrides (e.g. `"keel_cache" => "debug"`).
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            module_levels: BTreeMap::new(),
        }
    }
}

/// `~/.keel`, falling back to `/tmp/.keel` when `HOME` is unset.
pub fn keel_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".keel")
}
