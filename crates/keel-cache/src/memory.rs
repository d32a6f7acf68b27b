//! In-process `CacheStore` backed by a `DashMap`. Used when a single instance
//! runs without Redis and in hermetic tests. Expiry is checked lazily on access.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::error::CacheError;
use crate::store::{key_matcher, new_lock_token, CacheStore};

#[derive(Clone, Debug)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries. Reads already ignore them; this only frees memory.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| entry.is_live());
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let entry = self.entries.get(key)?;
        if entry.is_live() {
            Some(entry.clone())
        } else {
            drop(entry);
            self.entries.remove_if(key, |_, e| !e.is_live());
            None
        }
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Operation(format!("WRONGTYPE operation against key {key}"))
}

#[async_trait]
impl CacheStore for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), Entry::new(Value::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live()))
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Duration) -> Result<(), CacheError> {
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if !entry.is_live() {
                    *entry = Entry::new(Value::Set(BTreeSet::new()), ttl);
                }
                match &mut entry.value {
                    Value::Set(set) => {
                        set.insert(member.to_string());
                    }
                    Value::Str(_) => return Err(wrong_type(key)),
                }
                entry.expires_at = Instant::now() + ttl;
            }
            MapEntry::Vacant(vacant) => {
                let set = BTreeSet::from([member.to_string()]);
                vacant.insert(Entry::new(Value::Set(set), ttl));
            }
        }
        Ok(())
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> Result<(), CacheError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            match &mut entry.value {
                Value::Set(set) => {
                    set.remove(member);
                }
                Value::Str(_) => return Err(wrong_type(key)),
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str, max_members: usize) -> Result<Vec<String>, CacheError> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::Set(set), .. }) => {
                Ok(set.into_iter().take(max_members).collect())
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scan_keys(&self, pattern: &str, max_keys: usize) -> Result<Vec<String>, CacheError> {
        let matcher = key_matcher(pattern)?;
        Ok(self
            .entries
            .iter()
            .filter(|e| e.is_live() && matcher.is_match(e.key().as_str()))
            .map(|e| e.key().clone())
            .take(max_keys)
            .collect())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Option<String>, CacheError> {
        let token = new_lock_token();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live() {
                    return Ok(None);
                }
                occupied.insert(Entry::new(Value::Str(token.clone()), ttl));
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(Value::Str(token.clone()), ttl));
            }
        }
        Ok(Some(token))
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool, CacheError> {
        let removed = self.entries.remove_if(key, |_, entry| {
            entry.is_live() && matches!(&entry.value, Value::Str(held) if held == token)
        });
        Ok(removed.is_some())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
