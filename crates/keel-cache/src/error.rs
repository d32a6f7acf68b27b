use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Connection refused, dropped, or never established.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache operation {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// The server answered with an error.
    #[error("cache operation failed: {0}")]
    Operation(String),

    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },
}

impl CacheError {
    /// Whether the store itself looks unreachable, as opposed to a single
    /// command failing.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            CacheError::Unavailable(e.to_string())
        } else {
            CacheError::Operation(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_classification() {
        assert!(CacheError::Unavailable("refused".into()).is_unreachable());
        assert!(CacheError::Timeout { op: "get", after: Duration::from_millis(250) }.is_unreachable());
        assert!(!CacheError::Operation("WRONGTYPE".into()).is_unreachable());
        assert!(!CacheError::LockTimeout { key: "k".into(), waited: Duration::ZERO }.is_unreachable());
    }

    #[test]
    fn lock_timeout_message_names_key() {
        let err = CacheError::LockTimeout {
            key: "keel:lock:session:s1".into(),
            waited: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("keel:lock:session:s1"));
    }
}
