//! Embedding client with provider fallback
//!
//! Providers form an ordered chain: a local HTTP service first, then a
//! remote OpenAI-compatible endpoint. Results are cached by content hash
//! and each provider sits behind its own circuit breaker. There is no
//! fabricated fallback vector: when every provider fails the call fails
//! loudly with `AllProvidersFailed`.

mod breaker;
mod cache;
mod hashing;

pub use breaker::CircuitBreaker;
pub use cache::{EmbeddingCache, EmbeddingCacheStats};
pub use hashing::HashEmbeddingProvider;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{LimbicError, Result};
use crate::storage::queries::content_hash;
use crate::types::CircuitBreakerConfig;

/// Provider tag reported for cache hits
pub const CACHE_PROVIDER: &str = "cache";

/// Maximum input length in bytes before truncation
const MAX_INPUT_BYTES: usize = 8_000;

/// Default cache capacity: 64 MiB of float data
const DEFAULT_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Trait for embedding providers
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider tag used in labels and breaker keys
    fn name(&self) -> &str;

    /// Generate embeddings for a batch of texts
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Local embedding service (`POST /api/embed`)
pub struct LocalEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl LocalEmbeddingProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "input": texts,
            }))
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            return Err(LimbicError::ProviderRateLimited(60));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LimbicError::Embedding(format!(
                "local provider error {}: {}",
                status, body
            )));
        }

        let data: serde_json::Value = response.json().await?;
        let embeddings = data["embeddings"]
            .as_array()
            .ok_or_else(|| LimbicError::Embedding("invalid local response format".to_string()))?
            .iter()
            .map(|item| {
                item.as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .collect();

        Ok(embeddings)
    }
}

/// Remote OpenAI-compatible embedding service (`POST /v1/embeddings`)
pub struct RemoteEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl RemoteEmbeddingProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        // The remote contract takes one input per call
        for text in texts {
            let response = self
                .client
                .post(format!("{}/v1/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&serde_json::json!({
                    "model": self.model,
                    "input": text,
                }))
                .send()
                .await?;

            if response.status().as_u16() == 429 {
                return Err(LimbicError::ProviderRateLimited(60));
            }
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(LimbicError::Embedding(format!(
                    "remote provider error {}: {}",
                    status, body
                )));
            }

            let data: serde_json::Value = response.json().await?;
            let embedding: Vec<f32> = data["data"][0]["embedding"]
                .as_array()
                .ok_or_else(|| {
                    LimbicError::Embedding("invalid remote response format".to_string())
                })?
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            embeddings.push(embedding);
        }
        Ok(embeddings)
    }
}

/// Embedding client: provider chain + content-hash cache + breakers
pub struct EmbeddingClient {
    providers: Vec<Arc<dyn EmbeddingProvider>>,
    breakers: HashMap<String, CircuitBreaker>,
    cache: EmbeddingCache,
    dimensions: usize,
}

impl EmbeddingClient {
    /// Build a client over an ordered provider chain
    pub fn new(
        providers: Vec<Arc<dyn EmbeddingProvider>>,
        dimensions: usize,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        let breakers = providers
            .iter()
            .map(|p| {
                (
                    p.name().to_string(),
                    CircuitBreaker::new(breaker_config.clone()),
                )
            })
            .collect();
        Self {
            providers,
            breakers,
            cache: EmbeddingCache::new(DEFAULT_CACHE_BYTES),
            dimensions,
        }
    }

    /// Embedding dimension D
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed one text, returning the vector and the provider tag
    pub async fn embed(&self, text: &str) -> Result<(Vec<f32>, String)> {
        let input = prepare_input(text);
        if input.is_empty() {
            return Err(LimbicError::Validation("cannot embed empty text".into()));
        }

        let key = content_hash(&input);
        if let Some(cached) = self.cache.get(&key) {
            return Ok((cached.to_vec(), CACHE_PROVIDER.to_string()));
        }

        let mut failures: Vec<String> = Vec::new();
        for provider in &self.providers {
            let breaker = &self.breakers[provider.name()];
            if !breaker.allows() {
                failures.push(format!("{}: circuit open", provider.name()));
                continue;
            }

            match provider.embed_batch(std::slice::from_ref(&input)).await {
                Ok(mut vectors) if !vectors.is_empty() => {
                    breaker.record_success();
                    let vector = fit_dimension(vectors.remove(0), self.dimensions);
                    self.cache.put(key, vector.clone().into());
                    return Ok((vector, provider.name().to_string()));
                }
                Ok(_) => {
                    breaker.record_failure();
                    failures.push(format!("{}: empty response", provider.name()));
                }
                Err(e) => {
                    breaker.record_failure();
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        Err(LimbicError::AllProvidersFailed(failures.join("; ")))
    }

    /// Embed a batch, preferring the provider batch endpoint and falling
    /// back to per-item calls
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let inputs: Vec<String> = texts.iter().map(|t| prepare_input(t)).collect();

        for provider in &self.providers {
            let breaker = &self.breakers[provider.name()];
            if !breaker.allows() {
                continue;
            }
            match provider.embed_batch(&inputs).await {
                Ok(vectors) if vectors.len() == inputs.len() => {
                    breaker.record_success();
                    let fitted: Vec<Vec<f32>> = vectors
                        .into_iter()
                        .map(|v| fit_dimension(v, self.dimensions))
                        .collect();
                    for (input, vector) in inputs.iter().zip(fitted.iter()) {
                        self.cache.put(content_hash(input), vector.clone().into());
                    }
                    return Ok(fitted);
                }
                Ok(_) => breaker.record_failure(),
                Err(_) => breaker.record_failure(),
            }
        }

        // Per-item fallback walks the whole chain for each text
        let mut results = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let (vector, _) = self.embed(input).await?;
            results.push(vector);
        }
        Ok(results)
    }

    /// Cache statistics
    pub fn cache_stats(&self) -> EmbeddingCacheStats {
        self.cache.stats()
    }
}

/// Trim and truncate input to the provider byte budget, on a char boundary
fn prepare_input(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= MAX_INPUT_BYTES {
        return trimmed.to_string();
    }
    let mut end = MAX_INPUT_BYTES;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

/// Pad with zeros or truncate to the requested dimension
fn fit_dimension(mut vector: Vec<f32>, dimensions: usize) -> Vec<f32> {
    if vector.len() > dimensions {
        vector.truncate(dimensions);
    } else {
        vector.resize(dimensions, 0.0);
    }
    vector
}

/// Cosine similarity between two vectors
///
/// Mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic provider for tests: hashes the text into a vector
    pub struct StubProvider {
        name: String,
        dimensions: usize,
        calls: AtomicUsize,
        fail: bool,
    }

    impl StubProvider {
        pub fn new(name: &str, dimensions: usize, fail: bool) -> Self {
            Self {
                name: name.to_string(),
                dimensions,
                calls: AtomicUsize::new(0),
                fail,
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LimbicError::Embedding("stub failure".into()));
            }
            Ok(texts
                .iter()
                .map(|t| deterministic_vector(t, self.dimensions))
                .collect())
        }
    }

    /// Seeded pseudo-embedding: stable across calls for the same text
    pub fn deterministic_vector(text: &str, dimensions: usize) -> Vec<f32> {
        let hash = content_hash(text);
        let seed_bytes = hash.as_bytes();
        (0..dimensions)
            .map(|i| {
                let byte = seed_bytes[i % seed_bytes.len()] as f32;
                ((byte + i as f32) * 0.37).sin()
            })
            .collect()
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);

        // Mismatched lengths score 0
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_prepare_input_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_INPUT_BYTES); // 2 bytes per char
        let prepared = prepare_input(&long);
        assert!(prepared.len() <= MAX_INPUT_BYTES);
        assert!(prepared.is_char_boundary(prepared.len()));
    }

    #[test]
    fn test_fit_dimension() {
        assert_eq!(fit_dimension(vec![1.0, 2.0, 3.0], 2), vec![1.0, 2.0]);
        assert_eq!(fit_dimension(vec![1.0], 3), vec![1.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_cache_hit_labelled_cache() {
        let provider = Arc::new(StubProvider::new("stub", 8, false));
        let client = EmbeddingClient::new(
            vec![provider.clone()],
            8,
            CircuitBreakerConfig::default(),
        );

        let (first, tag) = client.embed("hello world").await.unwrap();
        assert_eq!(tag, "stub");

        let (second, tag) = client.embed("hello world").await.unwrap();
        assert_eq!(tag, CACHE_PROVIDER);
        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_to_secondary_provider() {
        let broken = Arc::new(StubProvider::new("primary", 8, true));
        let healthy = Arc::new(StubProvider::new("secondary", 8, false));
        let client = EmbeddingClient::new(
            vec![broken, healthy],
            8,
            CircuitBreakerConfig::default(),
        );

        let (_, tag) = client.embed("some text").await.unwrap();
        assert_eq!(tag, "secondary");
    }

    #[tokio::test]
    async fn test_all_providers_failed_is_loud() {
        let a = Arc::new(StubProvider::new("a", 8, true));
        let b = Arc::new(StubProvider::new("b", 8, true));
        let client = EmbeddingClient::new(vec![a, b], 8, CircuitBreakerConfig::default());

        let result = client.embed("text").await;
        assert!(matches!(result, Err(LimbicError::AllProvidersFailed(_))));
    }

    #[tokio::test]
    async fn test_breaker_short_circuits_after_failures() {
        let broken = Arc::new(StubProvider::new("flaky", 8, true));
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            window_seconds: 60,
            cooldown_seconds: 3600,
        };
        let client = EmbeddingClient::new(vec![broken.clone()], 8, config);

        let _ = client.embed("one").await;
        let _ = client.embed("two").await;
        let _ = client.embed("three").await;

        // Third call skipped the provider: breaker was open
        assert_eq!(broken.calls(), 2);
    }

    #[tokio::test]
    async fn test_embed_batch() {
        let provider = Arc::new(StubProvider::new("stub", 4, false));
        let client = EmbeddingClient::new(vec![provider], 4, CircuitBreakerConfig::default());

        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let vectors = client.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 4));
    }
}
