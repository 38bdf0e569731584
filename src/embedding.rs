//! Text embedding for chunk indexing and query vectors.
//!
//! Providers behind [`EmbeddingProvider`]:
//! - **[`HashProvider`]** - deterministic feature-hashing embedder; needs no
//!   network or model files. The default.
//! - **[`OpenAIProvider`]** - calls an OpenAI-compatible embeddings API with
//!   batching, retry, and backoff.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] - compute similarity between two embedding vectors
//! - [`vec_to_blob`] - encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`] - decode a SQLite BLOB back into a `Vec<f32>`
//!
//! Rate limiting (429), 5xx answers and transport errors are retried with
//! the same doubling delay as the chat client ([`backoff`]); any other 4xx
//! fails the index build immediately.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::index::tokenize;
use crate::llm::backoff;

/// Text → vector collaborator used at index time and query time.
///
/// The same provider must be used for both, so that query vectors live in
/// the same space as the stored chunk vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Recorded next to each stored vector.
    fn model_name(&self) -> &str;
    fn dims(&self) -> usize;
    /// Embeds a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embeds one search query.
pub async fn embed_query(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    let results = provider.embed(&[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .context("embedding provider returned no vector for the query")
}

// ============ Hash Provider ============

/// Feature-hashing embedder.
///
/// Each token is hashed (FNV-1a) into one of `dims` buckets with a sign bit,
/// and the result is L2-normalised. Cosine similarity between two vectors
/// then approximates weighted token overlap.
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

// ============ OpenAI Provider ============

/// Calls `POST {base_url}/v1/embeddings`. The key comes from the environment
/// variable named by `embedding.api_key_env`.
pub struct OpenAIProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_retries: u32,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

enum Attempt {
    Done(Vec<Vec<f32>>),
    Retry(anyhow::Error),
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let Some(model) = config.model.clone() else {
            bail!("embedding.model is required when embedding.provider = \"openai\"");
        };
        let Some(dims) = config.dims else {
            bail!("embedding.dims is required when embedding.provider = \"openai\"");
        };
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .with_context(|| format!("{} is not set; cannot embed papers", config.api_key_env))?;

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            model,
            dims,
            url: format!("{}/v1/embeddings", config.base_url.trim_end_matches('/')),
            api_key,
            max_retries: config.max_retries,
        })
    }

    async fn attempt(&self, body: &serde_json::Value, expected: usize) -> Result<Attempt> {
        let response = match self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Ok(Attempt::Retry(e.into())),
        };

        let status = response.status();
        if status.is_success() {
            let parsed: EmbeddingResponse = response
                .json()
                .await
                .context("malformed embeddings response")?;
            return order_embeddings(parsed, expected).map(Attempt::Done);
        }

        let detail = response.text().await.unwrap_or_default();
        let err = anyhow!("embeddings endpoint returned {}: {}", status, detail);
        if status.as_u16() == 429 || status.is_server_error() {
            Ok(Attempt::Retry(err))
        } else {
            Err(err)
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let mut last_err = anyhow!("no embedding attempts made");

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff(attempt)).await;
            }
            match self.attempt(&body, texts.len()).await? {
                Attempt::Done(vectors) => return Ok(vectors),
                Attempt::Retry(e) => {
                    tracing::warn!(error = %e, attempt, "embedding batch failed, retrying");
                    last_err = e;
                }
            }
        }

        Err(last_err.context(format!("embedding failed after {} attempts", self.max_retries + 1)))
    }
}

/// Puts vectors back in input order using each item's `index`, falling back
/// to response position.
fn order_embeddings(response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
    if response.data.len() != expected {
        bail!(
            "embeddings response has {} vectors for {} inputs",
            response.data.len(),
            expected
        );
    }
    let mut indexed: Vec<(usize, Vec<f32>)> = response
        .data
        .into_iter()
        .enumerate()
        .map(|(pos, d)| (d.index.unwrap_or(pos), d.embedding))
        .collect();
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Builds the provider named by `embedding.provider` (`"hash"` or `"openai"`).
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashProvider::new(config.effective_dims()))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        other => bail!("embedding.provider must be \"hash\" or \"openai\", got {:?}", other),
    }
}

/// Stores a vector as packed little-endian `f32`s for the `chunk_vectors`
/// BLOB column.
///
/// ```rust
/// use paper_harness::embedding::{blob_to_vec, vec_to_blob};
///
/// let v = vec![0.5f32, -1.0, 2.25];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 4 * v.len());
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// Inverse of [`vec_to_blob`]. Trailing bytes that do not fill an `f32`
/// are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .filter_map(|word| word.try_into().ok().map(f32::from_le_bytes))
        .collect()
}

/// Cosine of the angle between `a` and `b`; `0.0` when the lengths differ,
/// either side is empty, or either side is the zero vector.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });
    let magnitude = aa.sqrt() * bb.sqrt();
    if magnitude < f32::EPSILON {
        0.0
    } else {
        dot / magnitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_bounds() {
        let v = [0.3, -0.4, 1.2];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&v, &[-0.3, 0.4, -1.2]) + 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 2.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs_are_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hash_provider_is_deterministic_and_normalised() {
        let provider = HashProvider::new(64);
        let texts = vec!["attention is all you need".to_string()];
        let a = provider.embed(&texts).await.unwrap();
        let b = provider.embed(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
        let norm: f32 = a[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_hash_provider_similarity_tracks_overlap() {
        let provider = HashProvider::new(256);
        let q = provider.embed_one("transformer attention");
        let close = provider.embed_one("attention in the transformer architecture");
        let far = provider.embed_one("protein folding with graph networks");
        assert!(cosine_similarity(&q, &close) > cosine_similarity(&q, &far));
    }

    #[test]
    fn test_hash_provider_empty_text_is_zero_vector() {
        let v = HashProvider::new(8).embed_one("");
        assert!(v.iter().all(|x| *x == 0.0));
    }

    fn response(value: serde_json::Value) -> EmbeddingResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_order_embeddings_follows_index() {
        let vecs = order_embeddings(
            response(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0]},
                    {"index": 0, "embedding": [1.0, 0.0]}
                ]
            })),
            2,
        )
        .unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_order_embeddings_rejects_count_mismatch() {
        let err = order_embeddings(
            response(serde_json::json!({"data": [{"embedding": [1.0]}]})),
            2,
        )
        .unwrap_err();
        assert!(err.to_string().contains("1 vectors for 2 inputs"));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(40), Duration::from_secs(32));
    }
}
