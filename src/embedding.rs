//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — `dims() == 0`; vector search is skipped
//!   everywhere and `sync` indexes keyword-only.
//! - **[`RemoteProvider`]** — posts a batch of inputs with a model identifier
//!   to a vendor endpoint; one vector per input; 30 s timeout.
//! - **[`LocalProvider`]** — one input per request against a loopback
//!   endpoint; 60 s timeout.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — platform-endian f32 BLOB codec for
//!   the `chunks_vec` and `embedding_cache` tables
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx responses and network errors retry with exponential
//! backoff (1 s, 2 s, 4 s, … capped at 2^5); other 4xx responses fail
//! immediately.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::EmbeddingConfig;

/// Trait for embedding providers.
///
/// Carries provider metadata; the embedding computation itself is performed
/// by [`embed_texts`] (kept as a free function dispatching on config).
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name (`"remote"`, `"local"`, `"disabled"`).
    fn name(&self) -> &str;
    /// Model identifier sent on the wire.
    fn model_name(&self) -> &str;
    /// Embedding dimensionality. Zero disables vector search.
    fn dims(&self) -> usize;
}

/// Embed a batch of texts using the configured provider.
///
/// Returns one vector per input text, in input order.
pub async fn embed_texts(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    match config.provider.as_str() {
        "remote" => embed_remote(config, texts).await,
        "local" => embed_local(config, texts).await,
        "disabled" => bail!("embedding provider is disabled"),
        other => bail!("unknown embedding provider: {}", other),
    }
}

/// Embed a single query text (single-item batch).
pub async fn embed_query(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let results = embed_texts(config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
}

// ============ Disabled Provider ============

/// A no-op embedding provider; `dims()` of zero disables vector search.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ Remote Provider ============

/// Embedding provider calling a hosted vendor endpoint.
///
/// Sends `{"model": ..., "input": [texts]}` and reads back a
/// `{"data": [{"embedding": [...]}, ...]}` body. The API key is taken from
/// the `HIVEMIND_EMBED_API_KEY` environment variable when present.
pub struct RemoteProvider {
    model: String,
    dims: usize,
}

impl RemoteProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for remote provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for remote provider"))?;
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for RemoteProvider {
    fn name(&self) -> &str {
        "remote"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_remote(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;
    let url = config
        .url
        .as_deref()
        .unwrap_or("https://api.openai.com/v1/embeddings");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.remote_timeout_secs()))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client.post(url).json(&body);
        if let Ok(key) = std::env::var("HIVEMIND_EMBED_API_KEY") {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_remote_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err =
                        Some(anyhow::anyhow!("embedding API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("embedding API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding failed after retries")))
}

fn parse_remote_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("invalid embedding response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Local Provider ============

/// Embedding provider calling a local inference server on loopback.
///
/// Sends one `{"model": ..., "input": text}` request per input and reads
/// `{"embedding": [...]}` (or `{"embeddings": [[...]]}`).
pub struct LocalProvider {
    model: String,
    dims: usize,
}

impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for local provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for local provider"))?;
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_local(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;
    let url = config
        .url
        .as_deref()
        .unwrap_or("http://127.0.0.1:11434/api/embed");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.local_timeout_secs()))
        .build()?;

    let mut result = Vec::with_capacity(texts.len());

    for text in texts {
        let body = serde_json::json!({
            "model": model,
            "input": text,
        });

        let mut last_err = None;
        let mut done = false;

        for attempt in 0..=config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match client.post(url).json(&body).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        result.push(parse_local_response(&json)?);
                        done = true;
                        break;
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!(
                            "local embedding error {}: {}",
                            status,
                            body_text
                        ));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("local embedding error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!(
                        "local embedding connection error (is the server running at {}?): {}",
                        url,
                        e
                    ));
                    continue;
                }
            }
        }

        if !done {
            return Err(
                last_err.unwrap_or_else(|| anyhow::anyhow!("local embedding failed after retries"))
            );
        }
    }

    Ok(result)
}

fn parse_local_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    if let Some(embedding) = json.get("embedding").and_then(|e| e.as_array()) {
        return Ok(embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect());
    }

    if let Some(first) = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|arr| arr.first())
        .and_then(|e| e.as_array())
    {
        return Ok(first
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect());
    }

    bail!("invalid local embedding response: missing embedding")
}

/// Create the appropriate [`EmbeddingProvider`] from configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "remote" => Ok(Box::new(RemoteProvider::new(config)?)),
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        other => bail!("unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (platform-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_ne_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
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

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
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
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_disabled_provider_dims_zero() {
        let provider = DisabledProvider;
        assert_eq!(provider.dims(), 0);
        assert_eq!(provider.name(), "disabled");
    }

    #[test]
    fn test_parse_remote_response() {
        let json = serde_json::json!({
            "data": [
                {"embedding": [0.1, 0.2]},
                {"embedding": [0.3, 0.4]}
            ]
        });
        let vecs = parse_remote_response(&json).unwrap();
        assert_eq!(vecs.len(), 2);
        assert!((vecs[1][0] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_parse_local_response_both_shapes() {
        let single = serde_json::json!({"embedding": [1.0, 2.0]});
        assert_eq!(parse_local_response(&single).unwrap().len(), 2);

        let nested = serde_json::json!({"embeddings": [[3.0, 4.0, 5.0]]});
        assert_eq!(parse_local_response(&nested).unwrap().len(), 3);

        let bad = serde_json::json!({"nope": true});
        assert!(parse_local_response(&bad).is_err());
    }
}
