//! Text-to-vector embedders used by the indexer and the search engine.
//!
//! Two implementations are provided:
//! - `EmbeddingEngine`: synchronous ONNX runtime running bge-small-en-v1.5
//!   (384 dimensions) with mean pooling and L2 normalization.
//! - `HashEmbedder`: deterministic feature hashing of content words. Needs no
//!   model download, which makes it the default for tests and offline use.

use std::path::Path;
use std::sync::Arc;

use hf_hub::api::sync::ApiBuilder;
use ort::inputs;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use tokenizers::{Tokenizer, TruncationParams};

use crate::config::{Config, EmbeddingBackend};
use crate::errors::Error;
use crate::text;

/// Embedding dimensions for bge-small-en-v1.5 model.
pub const EMBEDDING_DIMS: usize = 384;

/// Converts text into a fixed-size vector.
///
/// Implementations are shared between the caller's thread and the
/// extraction workers, so they must be `Send + Sync`.
pub trait Embedder: Send + Sync {
    /// Embed a single text. Empty input yields a zero vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, Error>;

    /// Length of every vector returned by `embed`.
    fn dims(&self) -> usize;
}

/// Build the embedder selected by the configuration.
pub fn from_config(config: &Config) -> Result<Arc<dyn Embedder>, Error> {
    match config.embedding_backend {
        EmbeddingBackend::Hash => Ok(Arc::new(HashEmbedder::new(EMBEDDING_DIMS))),
        EmbeddingBackend::Onnx => Ok(Arc::new(EmbeddingEngine::new(
            &config.embedding_model,
            &config.model_cache,
        )?)),
    }
}

/// ONNX embedding engine for synchronous text-to-vector conversion.
pub struct EmbeddingEngine {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    requires_token_type_ids: bool,
}

impl EmbeddingEngine {
    /// Load model from cache or download on first use.
    ///
    /// Uses `hf_hub::api::sync::Api` with the ureq feature for blocking I/O.
    /// Files are cached under `cache_dir` and only downloaded once.
    pub fn new(model_id: &str, cache_dir: &Path) -> Result<Self, Error> {
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir.to_path_buf())
            .build()?;
        let repo = api.model(model_id.to_string());

        let model_path = repo
            .get("onnx/model.onnx")
            .or_else(|_| repo.get("model.onnx"))?;
        let tokenizer_path = repo.get("tokenizer.json")?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_path)?;
        tokenizer
            .with_padding(None)
            .with_truncation(Some(TruncationParams {
                max_length: 512,
                ..Default::default()
            }))?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(ort::Error::from)?
            .commit_from_file(&model_path)?;

        let requires_token_type_ids = session
            .inputs()
            .iter()
            .any(|input| input.name() == "token_type_ids");

        tracing::info!(model = model_id, "loaded ONNX embedding model");

        Ok(EmbeddingEngine {
            session: Mutex::new(session),
            tokenizer,
            requires_token_type_ids,
        })
    }

    fn mean_pool(
        &self,
        input_ids: &[u32],
        attention_mask: &[u32],
    ) -> Result<Vec<f32>, Error> {
        let seq_len = input_ids.len();

        let input_ids_vec: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
        let attention_mask_vec: Vec<i64> = attention_mask.iter().map(|&m| m as i64).collect();

        let input_ids_tensor = Tensor::from_array(([1usize, seq_len], input_ids_vec))?;
        let attention_mask_tensor = Tensor::from_array(([1usize, seq_len], attention_mask_vec))?;

        // The session is not reentrant; hold the lock until the output is copied out.
        let mut session = self.session.lock();
        let outputs = if self.requires_token_type_ids {
            let token_type_ids_tensor =
                Tensor::from_array(([1usize, seq_len], vec![0i64; seq_len]))?;
            session.run(inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_ids_tensor
            ])?
        } else {
            session.run(inputs![
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor
            ])?
        };

        let (shape, data) = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .ok_or_else(|| {
                Error::Inference(
                    "Output tensor 'last_hidden_state' or 'token_embeddings' not found".to_string(),
                )
            })?
            .try_extract_tensor::<f32>()?;

        if shape.len() != 3 {
            return Err(Error::Inference(format!(
                "Expected 3D output (batch, seq_len, hidden), got {:?}",
                shape
            )));
        }

        let batch_size = shape[0] as usize;
        let hidden_dim = shape[2] as usize;
        if batch_size != 1 || hidden_dim != EMBEDDING_DIMS {
            return Err(Error::Inference(format!(
                "Unexpected output shape: {:?}, batch=1, hidden={} expected",
                shape, EMBEDDING_DIMS
            )));
        }

        let mut pooled = vec![0.0f32; EMBEDDING_DIMS];
        for (token_idx, chunk) in data.chunks(hidden_dim).take(seq_len).enumerate() {
            let mask_value = attention_mask.get(token_idx).copied().unwrap_or(0) as f32;
            for (dim, pooled_value) in pooled.iter_mut().enumerate() {
                *pooled_value += chunk[dim] * mask_value;
            }
        }

        let mask_sum: f32 = attention_mask
            .iter()
            .take(seq_len)
            .map(|&m| m as f32)
            .sum::<f32>()
            .max(1e-9);
        for value in pooled.iter_mut() {
            *value /= mask_sum;
        }

        Ok(pooled)
    }
}

impl Embedder for EmbeddingEngine {
    /// Texts exceeding 512 tokens are silently truncated by the tokenizer.
    fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
        if text.is_empty() {
            return Ok(vec![0.0f32; EMBEDDING_DIMS]);
        }

        let encoding = self.tokenizer.encode(text, true)?;
        if encoding.get_ids().is_empty() {
            return Ok(vec![0.0f32; EMBEDDING_DIMS]);
        }

        let pooled = self.mean_pool(encoding.get_ids(), encoding.get_attention_mask())?;
        Ok(l2_normalize(&pooled))
    }

    fn dims(&self) -> usize {
        EMBEDDING_DIMS
    }
}

/// Deterministic bag-of-words embedder based on signed feature hashing.
///
/// Each content word and each adjacent word pair is hashed into one of
/// `dims` buckets with a hash-derived sign; the result is L2-normalized.
/// Texts sharing vocabulary get a positive cosine similarity.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn add_feature(&self, vec: &mut [f32], feature: &str, weight: f32) {
        let hash = fnv1a(feature.as_bytes());
        let bucket = (hash % self.dims as u64) as usize;
        let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIMS)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, input: &str) -> Result<Vec<f32>, Error> {
        let mut vec = vec![0.0f32; self.dims];
        let words: Vec<String> = text::tokenize(input)
            .into_iter()
            .filter(|w| !text::is_stopword(w))
            .collect();

        for word in &words {
            self.add_feature(&mut vec, word, 1.0);
        }
        for pair in words.windows(2) {
            self.add_feature(&mut vec, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        Ok(l2_normalize(&vec))
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// 64-bit FNV-1a; stable across platforms and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, &b| (hash ^ b as u64).wrapping_mul(PRIME))
}

pub(crate) fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|&x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vec.to_vec();
    }
    let norm = norm.max(1e-9);

    vec.iter().map(|&x| x / norm).collect()
}
