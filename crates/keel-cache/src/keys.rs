use keel_core::{OwnerKey, SessionId};

/// Key layout shared by every instance talking to the same cache.
///
/// ```text
/// {prefix}:session:{session_id}       cached session projection (JSON)
/// {prefix}:owner:{owner_key}          set of session ids owned by a caller
/// {prefix}:lock:session:{session_id}  per-session mutation lock
/// {prefix}:interrupt:{session_id}     pending interrupt flag
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn session(&self, id: &SessionId) -> String {
        format!("{}:session:{id}", self.prefix)
    }

    pub fn owner_index(&self, owner: &OwnerKey) -> String {
        format!("{}:owner:{owner}", self.prefix)
    }

    pub fn lock(&self, id: &SessionId) -> String {
        format!("{}:lock:session:{id}", self.prefix)
    }

    pub fn interrupt(&self, id: &SessionId) -> String {
        format!("{}:interrupt:{id}", self.prefix)
    }

    /// Match pattern for every cached session projection.
    pub fn session_pattern(&self) -> String {
        format!("{}:session:*", self.prefix)
    }
}

impl Default for CacheKeys {
    fn default() -> Self {
        Self::new("keel")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let keys = CacheKeys::new("prod");
        let sid = SessionId::from_raw("s1");
        assert_eq!(keys.session(&sid), "prod:session:s1");
        assert_eq!(keys.lock(&sid), "prod:lock:session:s1");
        assert_eq!(keys.owner_index(&OwnerKey::new("alice")), "prod:owner:alice");
        assert_eq!(keys.interrupt(&sid), "prod:interrupt:s1");
        assert_eq!(keys.session_pattern(), "prod:session:*");
    }

    #[test]
    fn auxiliary_keys_stay_out_of_session_scan() {
        let keys = CacheKeys::default();
        let sid = SessionId::from_raw("s1");
        let pattern_prefix = keys.session_pattern().trim_end_matches('*').to_string();
        assert!(!keys.lock(&sid).starts_with(&pattern_prefix));
        assert!(!keys.owner_index(&OwnerKey::new("o")).starts_with(&pattern_prefix));
        assert!(!keys.interrupt(&sid).starts_with(&pattern_prefix));
    }
}
