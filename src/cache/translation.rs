//! LRU cache for completed translation results
//!
//! Repeated reads for the same `(message, source, target)` triple are
//! common right after a fanout completes; this keeps the plaintext results
//! hot without touching the store or the encryption helper.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::trace;

use crate::types::TranslationResult;

/// Bounded LRU of plaintext translation results. No TTL; eviction is purely
/// least-recently-used at capacity.
pub struct TranslationCache {
    cache: Mutex<LruCache<String, TranslationResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TranslationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1"),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Deterministic cache key for a translation. A missing source language
    /// contributes an empty segment.
    pub fn cache_key(message_id: &str, source_language: Option<&str>, target_language: &str) -> String {
        format!(
            "{}:{}:{}",
            message_id,
            source_language.unwrap_or(""),
            target_language
        )
    }

    pub async fn get(&self, key: &str) -> Option<TranslationResult> {
        let mut cache = self.cache.lock().await;
        if let Some(result) = cache.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key, "translation cache hit");
            Some(result.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key, "translation cache miss");
            None
        }
    }

    pub async fn set(&self, key: String, result: TranslationResult) {
        let mut cache = self.cache.lock().await;
        cache.put(key, result);
    }

    pub async fn has(&self, key: &str) -> bool {
        let cache = self.cache.lock().await;
        cache.contains(key)
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cache.lock().await.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

/// Hit/miss counters for a cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_for(message_id: &str, target: &str, text: &str) -> TranslationResult {
        TranslationResult {
            message_id: message_id.to_string(),
            source_language: Some("en".to_string()),
            target_language: target.to_string(),
            translated_text: text.to_string(),
            translator_model: "medium".to_string(),
            confidence_score: 0.93,
            processing_time_ms: 42,
        }
    }

    #[test]
    fn test_cache_key_shape() {
        assert_eq!(TranslationCache::cache_key("m1", Some("en"), "fr"), "m1:en:fr");
        assert_eq!(TranslationCache::cache_key("m1", None, "fr"), "m1::fr");
    }

    #[tokio::test]
    async fn test_put_get_and_stats() {
        let cache = TranslationCache::new(10);
        let key = TranslationCache::cache_key("m1", Some("en"), "fr");

        assert!(cache.get(&key).await.is_none());
        cache.set(key.clone(), result_for("m1", "fr", "Bonjour")).await;
        assert!(cache.has(&key).await);

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.translated_text, "Bonjour");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_drops_least_recently_used() {
        let cache = TranslationCache::new(2);
        cache.set("k1".to_string(), result_for("m1", "fr", "un")).await;
        cache.set("k2".to_string(), result_for("m2", "fr", "deux")).await;

        // Touch k1 so k2 becomes the LRU entry.
        cache.get("k1").await.unwrap();
        cache.set("k3".to_string(), result_for("m3", "fr", "trois")).await;

        assert!(cache.has("k1").await);
        assert!(!cache.has("k2").await);
        assert!(cache.has("k3").await);
        assert_eq!(cache.len().await, 2);
    }
}
