//! ONNX Runtime embedding backend.
//!
//! Runs all-mpnet-base-v2 locally through `ort`: texts are tokenized with
//! padding to the batch's longest sequence, the model's token embeddings
//! are mean-pooled under the attention mask, and the pooled vectors are
//! scaled to unit length before they reach the store.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::{EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

/// all-mpnet-base-v2 was trained with 384-token sequences; longer input is
/// truncated rather than rejected.
const MAX_SEQ_LEN: usize = 384;

/// Embedding provider backed by a local ONNX session.
pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

// Safety: inference holds `&mut Session`, which the Mutex serializes; the
// tokenizer is only read after construction.
unsafe impl Send for LocalEmbeddingProvider {}
unsafe impl Sync for LocalEmbeddingProvider {}

/// Token ids and attention mask for one batch, flattened row-major.
struct EncodedBatch {
    input_ids: Vec<i64>,
    attention_mask: Vec<i64>,
    rows: usize,
    cols: usize,
}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let session = load_session(&cache_dir.join("model.onnx"))?;
        let tokenizer = load_tokenizer(&cache_dir.join("tokenizer.json"))?;
        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
        })
    }

    fn encode(&self, texts: &[&str]) -> Result<EncodedBatch> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let rows = encodings.len();
        let cols = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut input_ids = Vec::with_capacity(rows * cols);
        let mut attention_mask = Vec::with_capacity(rows * cols);
        for encoding in &encodings {
            input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }

        Ok(EncodedBatch {
            input_ids,
            attention_mask,
            rows,
            cols,
        })
    }
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text])?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedding batch came back empty"))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let batch = self.encode(texts)?;
        anyhow::ensure!(
            batch.rows == texts.len() && batch.cols > 0,
            "tokenizer produced a degenerate batch"
        );
        let shape = vec![batch.rows as i64, batch.cols as i64];
        let ids_tensor = Tensor::from_array((shape.clone(), batch.input_ids.into_boxed_slice()))?;
        let mask_tensor =
            Tensor::from_array((shape, batch.attention_mask.clone().into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;

        let outputs = session.run(ort::inputs! {
            "input_ids" => ids_tensor,
            "attention_mask" => mask_tensor,
        })?;

        // Per-token hidden states, [rows, seq, 768]. Exports disagree on the
        // output name, so probe the usual two before taking output 0.
        let hidden_states = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .unwrap_or_else(|| &outputs[0]);

        let (out_shape, data) = hidden_states
            .try_extract_tensor::<f32>()
            .context("failed to read hidden states from model output")?;

        let dims: &[i64] = &out_shape;
        anyhow::ensure!(
            dims.len() == 3 && dims[0] as usize == batch.rows && dims[2] == EMBEDDING_DIM as i64,
            "model returned shape {dims:?}, expected [{}, seq, {EMBEDDING_DIM}]",
            batch.rows
        );
        let seq = dims[1] as usize;

        let vectors = data
            .chunks_exact(seq * EMBEDDING_DIM)
            .zip(batch.attention_mask.chunks_exact(batch.cols))
            .map(|(row, mask)| l2_normalize(masked_mean(row, &mask[..seq.min(batch.cols)])))
            .collect();

        Ok(vectors)
    }
}

fn load_session(path: &Path) -> Result<Session> {
    anyhow::ensure!(
        path.exists(),
        "ONNX model not found at {}. Run `mnemo model download` first.",
        path.display()
    );
    let session = Session::builder()
        .map_err(|e| anyhow::anyhow!("failed to create ONNX session builder: {e}"))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| anyhow::anyhow!("failed to set optimization level: {e}"))?
        .with_intra_threads(4)
        .map_err(|e| anyhow::anyhow!("failed to set intra thread count: {e}"))?
        .commit_from_file(path)
        .context("failed to load ONNX model")?;
    tracing::info!(model = %path.display(), "ONNX model loaded");
    Ok(session)
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    anyhow::ensure!(
        path.exists(),
        "Tokenizer not found at {}. Run `mnemo model download` first.",
        path.display()
    );
    let mut tokenizer = Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length: MAX_SEQ_LEN,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::BatchLongest,
        ..Default::default()
    }));

    Ok(tokenizer)
}

/// Mean of the token embeddings whose attention mask is set.
///
/// `row` is one sequence's hidden states, `[seq * EMBEDDING_DIM]` flat;
/// `mask` has one entry per token. Padding tokens contribute nothing.
fn masked_mean(row: &[f32], mask: &[i64]) -> Vec<f32> {
    let mut pooled = vec![0.0f32; EMBEDDING_DIM];
    let mut tokens = 0.0f32;

    for (hidden, &m) in row.chunks_exact(EMBEDDING_DIM).zip(mask) {
        if m == 0 {
            continue;
        }
        for (acc, &x) in pooled.iter_mut().zip(hidden) {
            *acc += x;
        }
        tokens += 1.0;
    }

    if tokens > 0.0 {
        for x in &mut pooled {
            *x /= tokens;
        }
    }
    pooled
}

/// Scale a vector to unit length. A zero vector passes through unchanged.
fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_scales_to_unit_length() {
        // 2-3-6 is a Pythagorean triple: norm is exactly 7
        let v = l2_normalize(vec![2.0, 3.0, 6.0]);
        assert!((v[0] - 2.0 / 7.0).abs() < 1e-6);
        assert!((v[1] - 3.0 / 7.0).abs() < 1e-6);
        assert!((v[2] - 6.0 / 7.0).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        assert_eq!(l2_normalize(vec![0.0; 4]), vec![0.0; 4]);
    }

    #[test]
    fn masked_mean_skips_padding() {
        // Two "tokens", second one masked out: the mean is just token one
        let mut row = vec![0.0f32; 2 * EMBEDDING_DIM];
        row[0] = 4.0;
        row[1] = 2.0;
        row[EMBEDDING_DIM] = 100.0; // padding token, must not leak in
        let pooled = masked_mean(&row, &[1, 0]);
        assert_eq!(pooled[0], 4.0);
        assert_eq!(pooled[1], 2.0);
        assert_eq!(pooled[2], 0.0);
    }

    #[test]
    fn masked_mean_averages_live_tokens() {
        let mut row = vec![0.0f32; 2 * EMBEDDING_DIM];
        row[0] = 1.0;
        row[EMBEDDING_DIM] = 3.0;
        let pooled = masked_mean(&row, &[1, 1]);
        assert_eq!(pooled[0], 2.0);
    }

    #[test]
    fn masked_mean_of_all_padding_is_zero() {
        let row = vec![1.0f32; EMBEDDING_DIM];
        assert_eq!(masked_mean(&row, &[0]), vec![0.0; EMBEDDING_DIM]);
    }

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig {
            model: "all-mpnet-base-v2".into(),
            cache_dir: dirs::home_dir()
                .expect("home dir")
                .join(".mnemo/models")
                .to_string_lossy()
                .into_owned(),
        }
    }

    #[test]
    #[ignore] // Needs the downloaded model: cargo test -- --ignored
    fn embeds_to_768_unit_vectors() {
        let provider = LocalEmbeddingProvider::new(&test_config()).unwrap();
        let vector = provider.embed("Hello world").unwrap();
        assert_eq!(vector.len(), EMBEDDING_DIM);
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "expected unit norm, got {norm}");
    }

    #[test]
    #[ignore]
    fn batch_output_matches_single_embeds() {
        let provider = LocalEmbeddingProvider::new(&test_config()).unwrap();
        let texts = ["first sentence", "a somewhat longer second sentence"];
        let batch = provider.embed_batch(&texts).unwrap();
        assert_eq!(batch.len(), 2);

        for (text, from_batch) in texts.iter().zip(&batch) {
            let alone = provider.embed(text).unwrap();
            let dot: f32 = alone.iter().zip(from_batch).map(|(a, b)| a * b).sum();
            assert!(dot > 0.999, "batch row for {text:?} drifted from single embed");
        }
    }

    #[test]
    #[ignore]
    fn empty_batch_is_empty() {
        let provider = LocalEmbeddingProvider::new(&test_config()).unwrap();
        assert!(provider.embed_batch(&[]).unwrap().is_empty());
    }
}
