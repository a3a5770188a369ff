//! Small TTL cache.
//!
//! Used for the token configuration preflight (contract deployed,
//! operator role held), which is allowed to be cached because it checks
//! infrastructure wiring, not per-request trust. Registry verification
//! never goes through here.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            _ => None,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        self.entries.write().await.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop expired entries. Called from the periodic maintenance task;
    /// lookups already ignore expired entries so this only frees memory.
    pub async fn purge_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_then_expiry() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.insert("a", 1).await;
        assert_eq!(cache.get(&"a").await, Some(1));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(&"a").await, None);
    }

    #[tokio::test]
    async fn purge_removes_expired_only() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(50));
        cache.insert("old", 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.insert("new", 2).await;

        cache.purge_expired().await;
        let entries = cache.entries.read().await;
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key(&"new"));
    }
}
