//! TTL cache of conversation target languages
//!
//! Resolving the languages spoken in a conversation costs two store queries
//! (members + anonymous participants); this cache keeps the union for a few
//! minutes so a burst of messages in the same conversation resolves once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::trace;

struct Entry {
    languages: HashSet<String>,
    inserted_at: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Insertion order, oldest first. Used for capacity eviction.
    order: VecDeque<String>,
}

/// Bounded TTL cache from conversation id to the set of languages spoken by
/// its active participants. Capacity eviction is insertion-ordered; expired
/// entries are dropped on read.
pub struct LanguageCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl LanguageCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Get the cached language set. Expired entries are removed and report
    /// as a miss.
    pub async fn get(&self, conversation_id: &str) -> Option<HashSet<String>> {
        let mut inner = self.inner.lock().await;
        let expired = match inner.entries.get(conversation_id) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                return Some(entry.languages.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            trace!(conversation_id, "language cache entry expired");
            inner.entries.remove(conversation_id);
            inner.order.retain(|id| id != conversation_id);
        }
        None
    }

    /// Insert or refresh an entry, evicting the oldest insertion at capacity.
    pub async fn set(&self, conversation_id: &str, languages: HashSet<String>) {
        let mut inner = self.inner.lock().await;
        if inner.entries.contains_key(conversation_id) {
            inner.order.retain(|id| id != conversation_id);
        } else if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.order.push_back(conversation_id.to_string());
        inner.entries.insert(
            conversation_id.to_string(),
            Entry {
                languages,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn has(&self, conversation_id: &str) -> bool {
        self.get(conversation_id).await.is_some()
    }

    pub async fn delete(&self, conversation_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(conversation_id);
        inner.order.retain(|id| id != conversation_id);
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.order.clear();
    }

    /// Drop every expired entry; returns how many were removed.
    pub async fn clean_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let ttl = self.ttl;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        let removed = before - inner.entries.len();
        if removed > 0 {
            let alive: HashSet<String> = inner.entries.keys().cloned().collect();
            inner.order.retain(|id| alive.contains(id));
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn langs(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = LanguageCache::new(10, Duration::from_secs(300));
        cache.set("c1", langs(&["en", "fr"])).await;
        assert_eq!(cache.get("c1").await.unwrap(), langs(&["en", "fr"]));
        assert!(cache.has("c1").await);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_removed_on_read() {
        let cache = LanguageCache::new(10, Duration::from_millis(10));
        cache.set("c1", langs(&["en"])).await;
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(cache.get("c1").await.is_none());
        // Removal happened inside get, not just a filtered response.
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_insertion() {
        let cache = LanguageCache::new(2, Duration::from_secs(300));
        cache.set("c1", langs(&["en"])).await;
        cache.set("c2", langs(&["fr"])).await;
        cache.set("c3", langs(&["de"])).await;

        assert!(cache.get("c1").await.is_none());
        assert!(cache.get("c2").await.is_some());
        assert!(cache.get("c3").await.is_some());
    }

    #[tokio::test]
    async fn test_refresh_moves_entry_to_back_of_eviction_order() {
        let cache = LanguageCache::new(2, Duration::from_secs(300));
        cache.set("c1", langs(&["en"])).await;
        cache.set("c2", langs(&["fr"])).await;
        cache.set("c1", langs(&["en", "es"])).await;
        cache.set("c3", langs(&["de"])).await;

        assert!(cache.get("c2").await.is_none());
        assert_eq!(cache.get("c1").await.unwrap(), langs(&["en", "es"]));
    }

    #[tokio::test]
    async fn test_clean_expired() {
        let cache = LanguageCache::new(10, Duration::from_millis(10));
        cache.set("c1", langs(&["en"])).await;
        cache.set("c2", langs(&["fr"])).await;
        tokio::time::sleep(Duration::from_millis(25)).await;
        cache.set("c3", langs(&["de"])).await;

        assert_eq!(cache.clean_expired().await, 2);
        assert_eq!(cache.len().await, 1);
        assert!(cache.has("c3").await);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let cache = LanguageCache::new(10, Duration::from_secs(300));
        cache.set("c1", langs(&["en"])).await;
        cache.set("c2", langs(&["fr"])).await;

        cache.delete("c1").await;
        assert!(!cache.has("c1").await);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
