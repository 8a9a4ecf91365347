//! Bounded, time-expiring cache for embeddings and search results.
//!
//! Every operation runs under a single lock so that LRU reordering stays
//! atomic with the read or write that caused it. The cache is `Send + Sync`
//! and may be cleared from a background task while queries are running.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::Embedding;
use crate::error::{ProviderError, Result};
use crate::provider::EmbeddingProvider;

/// A cached value together with its insertion time.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,

    /// When the entry was written.
    pub inserted_at: Instant,
}

struct CacheState<V> {
    entries: LruCache<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// LRU cache with per-entry time-to-live.
pub struct Cache<V> {
    state: Mutex<CacheState<V>>,
    max_size: usize,
    ttl: Duration,
}

impl<V: Clone> Cache<V> {
    /// Create a cache holding at most `max_size` entries for `ttl` each.
    ///
    /// A zero `ttl` disables expiry; a zero `max_size` is treated as one.
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size: capacity.get(),
            ttl,
        }
    }

    /// Derive a stable key from an ordered list of parts.
    pub fn key<I, S>(parts: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_ref().as_bytes());
            hasher.update([0x1f]);
        }
        let digest = hasher.finalize();
        format!("{digest:x}")
    }

    fn is_expired(&self, entry: &CacheEntry<V>) -> bool {
        !self.ttl.is_zero() && entry.inserted_at.elapsed() >= self.ttl
    }

    /// Look up a key. Expired entries count as a miss and are removed.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let expired = match state.entries.get(key) {
            Some(entry) if !self.is_expired(entry) => {
                state.hits += 1;
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.pop(key);
            debug!("Cache entry expired: {key}");
        }
        state.misses += 1;
        None
    }

    /// Insert or replace a value, evicting the least recently used entry
    /// when the cache is full.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
        };

        let mut state = self.state.lock();
        if let Some((evicted, _)) = state.entries.push(key.clone(), entry) {
            if evicted != key {
                state.evictions += 1;
                debug!("Evicted least recently used cache entry: {evicted}");
            }
        }
    }

    /// Remove a single key.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.state.lock().entries.pop(key).map(|e| e.value)
    }

    /// Sweep all expired entries, returning how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }

        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.entries.pop(key);
        }

        if !expired.is_empty() {
            debug!("Removed {} expired cache entries", expired.len());
        }
        expired.len()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let removed = state.entries.len();
        state.entries.clear();
        info!("Cleared cache ({removed} entries)");
    }

    /// Number of live (possibly expired but not yet swept) entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of cache statistics.
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            size: state.entries.len(),
            max_size: self.max_size,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

/// Statistics about a cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries in cache.
    pub size: usize,

    /// Maximum cache size.
    pub max_size: usize,

    /// Successful lookups.
    pub hits: u64,

    /// Lookups that found nothing or an expired entry.
    pub misses: u64,

    /// Entries pushed out by capacity.
    pub evictions: u64,

    /// `hits / (hits + misses)`, zero before the first lookup.
    pub hit_rate: f64,
}

/// Embedding generation with a cache in front of the provider.
///
/// Only the texts that miss the cache are sent to the provider, in one call.
pub struct CachedEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<Cache<Embedding>>,
    dimension: usize,
}

impl CachedEmbedder {
    /// Wrap a provider. Fails if the provider cannot produce embeddings.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<Cache<Embedding>>,
        dimension: usize,
    ) -> Result<Self> {
        if !provider.supports_embeddings() {
            return Err(ProviderError::Unsupported {
                provider: provider.name().to_string(),
                capability: "embeddings",
            });
        }

        Ok(Self {
            provider,
            cache,
            dimension,
        })
    }

    fn cache_key(&self, text: &str) -> String {
        Cache::<Embedding>::key([self.provider.model(), text])
    }

    /// Embed a batch of texts, consulting the cache first.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let mut results: Vec<Option<Embedding>> = texts
            .iter()
            .map(|text| self.cache.get(&self.cache_key(text)))
            .collect();

        let missing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, cached)| cached.is_none())
            .map(|(i, _)| i)
            .collect();

        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            debug!(
                "Embedding cache: {} hits, {} misses",
                texts.len() - batch.len(),
                batch.len()
            );

            let generated = self.provider.generate_embeddings(&batch).await?;
            if generated.len() != batch.len() {
                return Err(ProviderError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    generated.len()
                )));
            }

            for (i, embedding) in missing.into_iter().zip(generated) {
                if embedding.len() != self.dimension {
                    return Err(ProviderError::DimensionMismatch {
                        expected: self.dimension,
                        actual: embedding.len(),
                    });
                }
                self.cache.put(self.cache_key(&texts[i]), embedding.clone());
                results[i] = Some(embedding);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Embedding> {
        let mut embeddings = self.embed(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| ProviderError::InvalidResponse("no embedding returned".to_string()))
    }

    /// The embedding model identifier recorded alongside stored vectors.
    pub fn model(&self) -> &str {
        self.provider.model()
    }

    /// Configured embedding dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Get the underlying cache.
    pub fn cache(&self) -> &Arc<Cache<Embedding>> {
        &self.cache
    }
}
