//! the shared cache used by the connections and the proxies

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// a key/value cache shared between requests
pub trait Cache: Send + Sync + std::fmt::Debug {
    /// read a value which has not expired yet
    fn get(&self, key: &str) -> Option<String>;
    /// write a value, `None` as ttl means it does not expire
    fn set(&self, key: &str, value: String, ttl: Option<Duration>);
    /// remove a value
    fn remove(&self, key: &str);
    /// remove all values whose key starts with the prefix
    fn clear(&self, prefix: &str);
}

/// a [Cache] in process memory
#[derive(Debug, Default)]
pub struct MemoryCache {
    /// values and their expiry time
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryCache {
    /// lock the entries, a poisoned lock still holds valid entries
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Option<Instant>)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries();
        let expired = matches!(
            entries.get(key),
            Some((_, Some(expires))) if *expires <= Instant::now()
        );
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|(value, _)| value.clone())
    }

    fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let expires = ttl.map(|ttl| Instant::now() + ttl);
        self.entries().insert(key.to_string(), (value, expires));
    }

    fn remove(&self, key: &str) {
        self.entries().remove(key);
    }

    fn clear(&self, prefix: &str) {
        self.entries().retain(|key, _| !key.starts_with(prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_expire() {
        let cache = MemoryCache::default();
        cache.set("a", "1".to_string(), Some(Duration::from_secs(60)));
        cache.set("b", "2".to_string(), Some(Duration::ZERO));
        cache.set("c", "3".to_string(), None);
        assert_eq!(cache.get("a").as_deref(), Some("1"));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn clear_only_removes_the_prefix() {
        let cache = MemoryCache::default();
        cache.set("LDAP-s01-x", "1".to_string(), None);
        cache.set("LDAP-s02-x", "2".to_string(), None);
        cache.clear("LDAP-s01-");
        assert_eq!(cache.get("LDAP-s01-x"), None);
        assert_eq!(cache.get("LDAP-s02-x").as_deref(), Some("2"));
    }
}
