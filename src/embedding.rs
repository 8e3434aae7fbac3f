//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and two concrete providers:
//! - **[`HashEmbedder`]** — deterministic, offline; used for tests and for
//!   running without an API key.
//! - **[`HttpEmbedder`]** — calls an OpenAI-compatible `/v1/embeddings`
//!   endpoint with batching, retry, and backoff.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for
//!   SQLite BLOB storage
//! - [`blob_to_vec`] — decode a SQLite BLOB back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! The HTTP provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 401/402/403 (auth or quota) → fail immediately, no retry
//! - HTTP 400 (input too long) → fail immediately; the caller must
//!   re-chunk smaller, not retry as-is
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Capability interface for embedding providers.
///
/// `embed` maps a batch of texts to an aligned sequence of vectors: same
/// cardinality, same order, and `embed(&[]) → Ok(vec![])`. Every returned
/// vector has exactly `dims()` components.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model(&self) -> &str;
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Verify that a provider response is aligned with its input and declared
/// dimensionality. A dimension drift is a hard error, never coerced.
fn verify_response(
    model: &str,
    dims: usize,
    input_len: usize,
    vectors: &[Vec<f32>],
) -> Result<()> {
    if vectors.len() != input_len {
        return Err(Error::ProviderFatal(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            input_len
        )));
    }
    for v in vectors {
        if v.len() != dims {
            return Err(Error::EmbeddingSpaceMismatch {
                expected_model: model.to_string(),
                expected_dims: dims,
                got_model: model.to_string(),
                got_dims: v.len(),
            });
        }
    }
    Ok(())
}

// ============ Hash Provider ============

/// Deterministic offline embedder.
///
/// Each component is derived from a SHA-256 digest of the text and the
/// component index, mapped into `[-1.0, 1.0]`. The same text always embeds
/// to the same vector, which makes retrieval behavior reproducible in
/// tests: a query equal to a stored segment scores cosine 1.0 against it.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dims);
        let mut block = 0u32;
        let mut bytes: Vec<u8> = Vec::new();
        while out.len() < self.dims {
            if bytes.is_empty() {
                let mut hasher = Sha256::new();
                hasher.update(text.as_bytes());
                hasher.update(block.to_le_bytes());
                bytes = hasher.finalize().to_vec();
                block += 1;
            }
            let chunk: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
            bytes.drain(..4);
            let raw = u32::from_le_bytes(chunk);
            out.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        out
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model(&self) -> &str {
        "hash-v1"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors: Vec<Vec<f32>> = texts.iter().map(|t| self.embed_one(t)).collect();
        verify_response(self.model(), self.dims, texts.len(), &vectors)?;
        Ok(vectors)
    }
}

// ============ HTTP Provider ============

/// Embedding provider backed by an OpenAI-compatible embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable. Batches are sent as
/// a single request; transient failures retry with exponential backoff up
/// to `max_retries` times, each attempt bounded by `timeout_secs`.
pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    dims: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Configuration("embedding.model required for http provider".to_string()))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(Error::Configuration(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            model,
            dims: config.dims,
            max_retries: config.max_retries,
            client,
        })
    }

    async fn request_once(&self, api_key: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ProviderTransient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response.json().await?;
            return parse_embeddings_response(&json);
        }

        let body_text = response.text().await.unwrap_or_default();
        match status.as_u16() {
            429 => Err(Error::ProviderTransient(format!("rate limited: {body_text}"))),
            400 => Err(Error::InvalidInput(body_text)),
            401 | 402 | 403 => Err(Error::ProviderFatal(format!("{status}: {body_text}"))),
            s if status.is_server_error() => {
                Err(Error::ProviderTransient(format!("{s}: {body_text}")))
            }
            _ => Err(Error::ProviderFatal(format!("{status}: {body_text}"))),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Configuration("OPENAI_API_KEY not set".to_string()))?;

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.request_once(&api_key, texts).await {
                Ok(vectors) => {
                    verify_response(&self.model, self.dims, texts.len(), &vectors)?;
                    return Ok(vectors);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, error = %e, "embedding request failed, will retry");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::ProviderTransient("embedding failed after retries".to_string())))
    }
}

/// Parse an OpenAI-style embeddings response, honoring the per-item
/// `index` field so output order matches input order.
fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::ProviderFatal("invalid response: missing data array".to_string()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::ProviderFatal("invalid response: missing embedding".to_string()))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);

    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the configured [`Embedder`].
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(config.dims))),
        "http" => Ok(Box::new(HttpEmbedder::new(config)?)),
        other => Err(Error::Configuration(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed(&["same text".to_string()]).await.unwrap();
        let b = embedder.embed(&["same text".to_string()]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 64);
    }

    #[tokio::test]
    async fn test_hash_embedder_dims_invariant_across_inputs() {
        let embedder = HashEmbedder::new(48);
        let vectors = embedder
            .embed(&["short".to_string(), "a much longer piece of text".to_string()])
            .await
            .unwrap();
        assert!(vectors.iter().all(|v| v.len() == 48));
    }

    #[tokio::test]
    async fn test_hash_embedder_empty_batch() {
        let embedder = HashEmbedder::new(8);
        let vectors = embedder.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn test_hash_embedder_alignment() {
        let embedder = HashEmbedder::new(16);
        let texts: Vec<String> = (0..5).map(|i| format!("text {i}")).collect();
        let vectors = embedder.embed(&texts).await.unwrap();
        assert_eq!(vectors.len(), texts.len());
        // Same text re-embedded individually matches its batch position.
        let solo = embedder.embed(&texts[3..4]).await.unwrap();
        assert_eq!(solo[0], vectors[3]);
    }

    #[test]
    fn test_verify_response_rejects_dim_drift() {
        let vectors = vec![vec![0.0f32; 8], vec![0.0f32; 7]];
        let err = verify_response("m", 8, 2, &vectors).unwrap_err();
        assert!(matches!(err, Error::EmbeddingSpaceMismatch { .. }));
    }

    #[test]
    fn test_parse_response_honors_index_field() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [2.0]},
                {"index": 0, "embedding": [1.0]},
            ]
        });
        let vectors = parse_embeddings_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0f32], vec![2.0f32]]);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        let restored = blob_to_vec(&blob);
        assert_eq!(vec, restored);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
