pub mod local;

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

use crate::config::EmbeddingConfig;

/// Number of dimensions in the embedding vectors (all-mpnet-base-v2).
pub const EMBEDDING_DIM: usize = 768;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`]
/// dimensions. All methods are synchronous — callers in async contexts should
/// use `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of text strings, preserving input order. The batch
    /// fails as a whole on hard errors so the caller can stop or retry.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Process-lifetime embedder with lazy model load.
///
/// The first call to [`available`](Self::available), [`embed`](Self::embed),
/// or [`embed_batch`](Self::embed_batch) attempts to load the ONNX model; the
/// outcome — including failure — is cached for the rest of the process, so a
/// missing model is probed exactly once and the vector path stays disabled.
pub struct LazyEmbedder {
    config: EmbeddingConfig,
    provider: OnceLock<Option<local::LocalEmbeddingProvider>>,
}

impl LazyEmbedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            provider: OnceLock::new(),
        }
    }

    fn get(&self) -> Option<&local::LocalEmbeddingProvider> {
        self.provider
            .get_or_init(|| match local::LocalEmbeddingProvider::new(&self.config) {
                Ok(provider) => Some(provider),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding model unavailable, vector indexing disabled");
                    None
                }
            })
            .as_ref()
    }

    /// Probe (and cache) model availability.
    pub fn available(&self) -> bool {
        self.get().is_some()
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.get()
            .ok_or_else(|| anyhow!("embedding model unavailable"))?
            .embed(text)
    }

    pub fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        self.get()
            .ok_or_else(|| anyhow!("embedding model unavailable"))?
            .embed_batch(texts)
    }

    pub fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Reinterpret an f32 embedding slice as raw bytes for sqlite-vec.
pub fn vector_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Decode a stored embedding blob back into f32s.
pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
