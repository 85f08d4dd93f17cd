use std::{collections::BTreeMap, collections::HashMap, fmt, time::Duration};

use serde_json::Value;

/// Deterministic cache key: endpoint plus parameters sorted by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    endpoint: String,
    key: String,
}

impl Fingerprint {
    pub fn new<K, V>(endpoint: impl Into<String>, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let endpoint = endpoint.into();
        let sorted: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mut key = endpoint.clone();
        for (idx, (name, value)) in sorted.iter().enumerate() {
            key.push(if idx == 0 { '?' } else { '&' });
            key.push_str(name);
            key.push('=');
            key.push_str(value);
        }

        Self { endpoint, key }
    }

    /// Fingerprint of a parameterless endpoint.
    pub fn endpoint_only(endpoint: impl Into<String>) -> Self {
        Self::new(endpoint, std::iter::empty::<(String, String)>())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    endpoint: String,
    value: Value,
    expires_at_ms: u64,
}

/// Time-bound response cache keyed by [`Fingerprint`].
///
/// All operations take the current time explicitly; an entry whose expiry is
/// at or before `now_ms` is never returned.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unexpired value for `fingerprint`. Expired entries are purged.
    pub fn get(&mut self, fingerprint: &Fingerprint, now_ms: u64) -> Option<Value> {
        let expired = match self.entries.get(fingerprint.as_str()) {
            Some(entry) if entry.expires_at_ms > now_ms => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(fingerprint.as_str());
        }
        None
    }

    /// Store `value`, overwriting any previous entry for the fingerprint.
    pub fn insert(&mut self, fingerprint: &Fingerprint, value: Value, ttl: Duration, now_ms: u64) {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.entries.insert(
            fingerprint.as_str().to_owned(),
            CacheEntry {
                endpoint: fingerprint.endpoint().to_owned(),
                value,
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            },
        );
    }

    pub fn invalidate(&mut self, fingerprint: &Fingerprint) -> bool {
        self.entries.remove(fingerprint.as_str()).is_some()
    }

    /// Drop every entry whose endpoint starts with `prefix`. Returns the count removed.
    pub fn invalidate_prefix(&mut self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.endpoint.starts_with(prefix));
        before - self.entries.len()
    }

    /// Purge expired entries. Returns the count removed.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms > now_ms);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
