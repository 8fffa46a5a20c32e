use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};

// key: embeddings -> provider-interface,cache

/// Provider interface. Real providers (OpenAI-style, local models) live
/// outside the core; the deterministic hash provider below keeps the
/// pipeline self-contained.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;

    fn embed_batch(&self, texts: &[&str]) -> Vec<Vec<f32>> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    fn dimension(&self) -> usize;
    fn provider_name(&self) -> &'static str;
    fn model_name(&self) -> String;
}

/// Deterministic embedding derived from byte n-gram hashes. Not semantic,
/// but stable, cheap and good enough for recurrence lookups in tests and
/// local runs.
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimension];
        let bytes = text.as_bytes();
        for window in bytes.windows(3.min(bytes.len().max(1))) {
            let mut hasher = Sha256::new();
            hasher.update(window);
            let digest = hasher.finalize();
            let bucket = usize::from(digest[0]) % self.dimension;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &'static str {
        "hash"
    }

    fn model_name(&self) -> String {
        format!("ngram-sha256-{}", self.dimension)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
}

/// LRU memory tier plus optional disk directory. Disk entries are JSON
/// vectors named by the sha256 of the text.
pub struct EmbeddingCache {
    memory: Mutex<LruCache<String, Vec<f32>>>,
    disk_dir: Option<PathBuf>,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(max_size: usize, disk_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = &disk_dir {
            if let Err(err) = std::fs::create_dir_all(dir) {
                tracing::warn!(?err, dir = %dir.display(), "failed to create embedding cache dir");
            }
        }
        let capacity = NonZeroUsize::new(max_size.max(1)).expect("cache capacity");
        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            disk_dir,
            max_size: max_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn cache_key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = Self::cache_key(text);
        {
            let mut memory = self.memory.lock().expect("embedding cache mutex");
            if let Some(vector) = memory.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(vector.clone());
            }
        }
        if let Some(vector) = self.load_from_disk(&key) {
            self.memory
                .lock()
                .expect("embedding cache mutex")
                .put(key, vector.clone());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(vector);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, text: &str, vector: Vec<f32>) {
        let key = Self::cache_key(text);
        if let Some(dir) = &self.disk_dir {
            let path = dir.join(format!("{key}.json"));
            match serde_json::to_vec(&vector) {
                Ok(bytes) => {
                    if let Err(err) = std::fs::write(&path, bytes) {
                        tracing::warn!(?err, "failed to write embedding to disk cache");
                    }
                }
                Err(err) => tracing::warn!(?err, "failed to serialize embedding"),
            }
        }
        self.memory
            .lock()
            .expect("embedding cache mutex")
            .put(key, vector);
    }

    fn load_from_disk(&self, key: &str) -> Option<Vec<f32>> {
        let dir = self.disk_dir.as_ref()?;
        let bytes = std::fs::read(dir.join(format!("{key}.json"))).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            size: self.memory.lock().expect("embedding cache mutex").len(),
            max_size: self.max_size,
        }
    }
}

/// Wraps a provider with the LRU+disk cache so repeated texts never hit the
/// underlying provider twice.
pub struct CachingEmbeddingProvider {
    inner: std::sync::Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
}

impl CachingEmbeddingProvider {
    pub fn new(inner: std::sync::Arc<dyn EmbeddingProvider>, cache: EmbeddingCache) -> Self {
        Self { inner, cache }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl EmbeddingProvider for CachingEmbeddingProvider {
    fn embed(&self, text: &str) -> Vec<f32> {
        if let Some(vector) = self.cache.get(text) {
            return vector;
        }
        let vector = self.inner.embed(text);
        self.cache.put(text, vector.clone());
        vector
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn provider_name(&self) -> &'static str {
        self.inner.provider_name()
    }

    fn model_name(&self) -> String {
        self.inner.model_name()
    }
}

/// Minimal in-memory cosine index used by triage for "similar past
/// exception" evidence. The production vector store sits behind the same
/// shape externally.
#[derive(Default)]
pub struct SimilarityIndex {
    entries: Mutex<Vec<(String, Vec<f32>)>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, label: &str, vector: Vec<f32>) {
        self.entries
            .lock()
            .expect("similarity index mutex")
            .push((label.to_string(), vector));
    }

    pub fn nearest(&self, vector: &[f32], top_k: usize) -> Vec<(String, f32)> {
        let entries = self.entries.lock().expect("similarity index mutex");
        let mut scored: Vec<(String, f32)> = entries
            .iter()
            .map(|(label, candidate)| (label.clone(), cosine(vector, candidate)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embeddings_are_deterministic_and_normalized() {
        let provider = HashEmbeddingProvider::new(32);
        let a = provider.embed("invoice mismatch on account 42");
        let b = provider.embed("invoice mismatch on account 42");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cache_counts_hits_and_misses() {
        let cache = EmbeddingCache::new(2, None);
        assert!(cache.get("a").is_none());
        cache.put("a", vec![1.0]);
        assert!(cache.get("a").is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn lru_evicts_oldest() {
        let cache = EmbeddingCache::new(2, None);
        cache.put("a", vec![1.0]);
        cache.put("b", vec![2.0]);
        cache.put("c", vec![3.0]);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn disk_tier_survives_memory_eviction() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(1, Some(tmp.path().to_path_buf()));
        cache.put("a", vec![1.0, 2.0]);
        cache.put("b", vec![3.0]);
        // "a" was evicted from memory but remains on disk
        assert_eq!(cache.get("a"), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn caching_provider_serves_repeats_from_cache() {
        let provider = CachingEmbeddingProvider::new(
            std::sync::Arc::new(HashEmbeddingProvider::new(16)),
            EmbeddingCache::new(8, None),
        );
        let first = provider.embed("invoice mismatch");
        let second = provider.embed("invoice mismatch");
        assert_eq!(first, second);
        let stats = provider.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn similarity_index_ranks_by_cosine() {
        let provider = HashEmbeddingProvider::new(32);
        let index = SimilarityIndex::new();
        index.insert("EXC-1: invoice mismatch", provider.embed("invoice mismatch"));
        index.insert("EXC-2: payment timeout", provider.embed("payment gateway timeout"));
        let query = provider.embed("invoice mismatch on account");
        let results = index.nearest(&query, 1);
        assert_eq!(results.len(), 1);
        assert!(results[0].0.starts_with("EXC-1"));
    }
}
