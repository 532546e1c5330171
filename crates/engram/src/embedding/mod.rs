//! Embedding generation
//!
//! The store treats embedding as a pluggable, fallible dependency: a write
//! never fails because the embedder is down, it just lands without a vector.
//! Two providers ship in-tree: fastembed's local ONNX model and a
//! deterministic hash embedder for tests and constrained environments.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{EngramError, Result};

/// A text embedding provider.
///
/// Implementations must be cheap to call concurrently; `embed` runs inside
/// `spawn_blocking` from async contexts.
pub trait Embedder: Send + Sync {
    /// Provider name for logs and health reporting
    fn name(&self) -> &'static str;

    /// Output vector dimension
    fn dimension(&self) -> usize;

    /// Whether the provider is ready to serve
    fn is_available(&self) -> bool;

    /// Embed one text into a vector of `dimension()` floats
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Local ONNX embedding via fastembed
pub struct FastEmbedder {
    // fastembed's session is not Sync; serialize access
    model: Mutex<TextEmbedding>,
    dimension: usize,
}

impl FastEmbedder {
    pub fn new(dimension: usize) -> Result<Self> {
        let options = InitOptions::new(EmbeddingModel::MultilingualE5Small)
            .with_show_download_progress(false);

        let model = TextEmbedding::try_new(options)
            .map_err(|e| EngramError::Embedding(format!("Failed to load model: {e}")))?;

        Ok(Self {
            model: Mutex::new(model),
            dimension,
        })
    }
}

impl Embedder for FastEmbedder {
    fn name(&self) -> &'static str {
        "fastembed"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn is_available(&self) -> bool {
        !self.model.is_poisoned()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| EngramError::Embedding("Embedding model lock poisoned".to_string()))?;

        let mut vectors = model
            .embed(vec![text], None)
            .map_err(|e| EngramError::Embedding(format!("Failed to embed text: {e}")))?;

        let vector = vectors
            .pop()
            .ok_or_else(|| EngramError::Embedding("Model returned no embedding".to_string()))?;

        if vector.len() != self.dimension {
            return Err(EngramError::Embedding(format!(
                "Model returned dimension {}, expected {}",
                vector.len(),
                self.dimension
            )));
        }

        Ok(vector)
    }
}

/// Deterministic hash-seeded embeddings.
///
/// Identical texts map to identical vectors, so similarity search behaves
/// consistently without a model download. Used by tests and selectable in
/// config for air-gapped deployments.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn is_available(&self) -> bool {
        true
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let mut seed = hasher.finish();

        // xorshift over the seed; normalized to unit length
        let mut vector = Vec::with_capacity(self.dimension);
        for _ in 0..self.dimension {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            vector.push(((seed % 2000) as f32 / 1000.0) - 1.0);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }

        Ok(vector)
    }
}

/// Build the configured embedding provider
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "fastembed" => Ok(Arc::new(FastEmbedder::new(config.dimension)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dimension))),
        other => Err(EngramError::Config(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// Embed text with a deadline, degrading to `None` on timeout or failure.
///
/// This is the write path's entry point: the caller persists the record
/// either way and reports degraded mode to the client.
pub async fn embed_with_timeout(
    embedder: Arc<dyn Embedder>,
    text: String,
    timeout: Duration,
) -> Option<Vec<f32>> {
    let task = tokio::task::spawn_blocking(move || embedder.embed(&text));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(vector))) => Some(vector),
        Ok(Ok(Err(e))) => {
            warn!("Embedding failed, storing without vector: {e}");
            None
        }
        Ok(Err(e)) => {
            warn!("Embedding task panicked: {e}");
            None
        }
        Err(_) => {
            warn!("Embedding timed out after {timeout:?}, storing without vector");
            None
        }
    }
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero inputs
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

    #[test]
    fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(384);
        let a = embedder.embed("rust is fast").unwrap();
        let b = embedder.embed("rust is fast").unwrap();
        let c = embedder.embed("go is simple").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 384);
    }

    #[test]
    fn test_hash_embedder_output_is_normalized() {
        let embedder = HashEmbedder::new(64);
        let v = embedder.embed("some text").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_similarity_identity() {
        let v = vec![0.5, 0.5, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    // Requires a model download; run with `--features ml-tests`
    #[test]
    #[cfg(feature = "ml-tests")]
    fn test_fastembed_produces_expected_dimension() {
        let embedder = FastEmbedder::new(384).unwrap();
        let vector = embedder.embed("hello world").unwrap();
        assert_eq!(vector.len(), 384);
    }

    #[tokio::test]
    async fn test_embed_with_timeout_returns_vector() {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(16));
        let result = embed_with_timeout(
            embedder,
            "hello".to_string(),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn test_embed_with_timeout_degrades_on_failure() {
        struct FailingEmbedder;
        impl Embedder for FailingEmbedder {
            fn name(&self) -> &'static str {
                "failing"
            }
            fn dimension(&self) -> usize {
                16
            }
            fn is_available(&self) -> bool {
                false
            }
            fn embed(&self, _text: &str) -> Result<Vec<f32>> {
                Err(EngramError::Embedding("down".to_string()))
            }
        }

        let embedder: Arc<dyn Embedder> = Arc::new(FailingEmbedder);
        let result = embed_with_timeout(
            embedder,
            "hello".to_string(),
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_none());
    }
}
