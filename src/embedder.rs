//! Embedding model wrapper.
//!
//! Defines the [`Embedder`] trait the ingester and search service consume,
//! and two implementations:
//! - **[`LocalEmbedder`]** — runs models in-process via fastembed; the model
//!   artifact is downloaded on first use into the configured cache directory
//!   and no network calls happen afterwards.
//! - **[`HashEmbedder`]** — deterministic vectors derived from a SHA-256 of
//!   the input; no model involved. Used by the test suite and useful for
//!   offline smoke runs.
//!
//! # Contract
//!
//! Every implementation guarantees: returned vectors have length [`dim`];
//! vectors are L2-normalized (cosine distance reduces to inner product);
//! concurrent calls are serialized internally; an empty input yields an
//! empty output and zero tokens; oversize inputs are truncated by the model
//! runtime. `Close()` semantics are carried by `Drop`.
//!
//! [`dim`]: Embedder::dim

use anyhow::Result;

/// Approximate chars-per-token ratio; the runtime reports no exact counts.
const CHARS_PER_TOKEN: usize = 4;

/// Result of one embed call.
#[derive(Debug, Clone, Default)]
pub struct EmbedOutput {
    /// One vector per input text, in input order, each of length `dim()`.
    pub vectors: Vec<Vec<f32>>,
    /// Estimated token count across all inputs.
    pub total_tokens: usize,
}

/// An in-process embedding model.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. Implementations serialize concurrent calls.
    fn embed(&self, texts: &[String]) -> Result<EmbedOutput>;
    /// Vector dimensionality.
    fn dim(&self) -> usize;
    /// Model identifier persisted alongside every embedding row.
    fn model_id(&self) -> &str;
}

/// Estimate tokens for a batch from its character count.
fn estimate_tokens(texts: &[String]) -> usize {
    texts.iter().map(|t| t.chars().count() / CHARS_PER_TOKEN).sum()
}

/// Scale a vector to unit length in place. Zero vectors stay zero.
fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

// ============ Local provider (fastembed) ============

/// Known local models and their dimensionality.
#[cfg(feature = "local-embeddings")]
fn resolve_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel;
    match name {
        "all-minilm-l6-v2" => Ok((EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((EmbeddingModel::BGEBaseENV15, 768)),
        "nomic-embed-text-v1.5" => Ok((EmbeddingModel::NomicEmbedTextV15, 768)),
        "multilingual-e5-small" => Ok((EmbeddingModel::MultilingualE5Small, 384)),
        other => anyhow::bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small",
            other
        ),
    }
}

/// Embedder backed by a local fastembed model.
///
/// Construction ensures the model artifact is present, downloading it with
/// progress on first use. The inner model is behind a mutex; fastembed's
/// `embed` needs exclusive access, which also provides the serialization
/// the contract promises.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
    model_id: String,
    dim: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(model_id: &str, cache_dir: &std::path::Path) -> Result<Self> {
        let (model, dim) = resolve_model(model_id)?;
        std::fs::create_dir_all(cache_dir)?;

        let embedding = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(model)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(true),
        )
        .map_err(|e| anyhow::anyhow!("failed to initialize embedding model: {}", e))?;

        Ok(Self {
            model: std::sync::Mutex::new(embedding),
            model_id: model_id.to_string(),
            dim,
        })
    }
}

#[cfg(feature = "local-embeddings")]
impl Embedder for LocalEmbedder {
    fn embed(&self, texts: &[String]) -> Result<EmbedOutput> {
        if texts.is_empty() {
            return Ok(EmbedOutput::default());
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("embedding model lock poisoned"))?;

        let mut vectors = model
            .embed(texts.to_vec(), None)
            .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;

        for vector in &mut vectors {
            l2_normalize(vector);
        }

        Ok(EmbedOutput {
            vectors,
            total_tokens: estimate_tokens(texts),
        })
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============ Hash provider (deterministic) ============

/// Deterministic embedder with no model behind it.
///
/// Vectors are derived from a SHA-256 of the text, so identical inputs
/// always produce identical unit vectors. Useful wherever the real model
/// would be dead weight: tests, CI, offline smoke runs.
pub struct HashEmbedder {
    dim: usize,
    model_id: String,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            model_id: format!("hash-{}", dim),
        }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, texts: &[String]) -> Result<EmbedOutput> {
        use sha2::{Digest, Sha256};

        let vectors = texts
            .iter()
            .map(|text| {
                let mut vector = Vec::with_capacity(self.dim);
                let mut digest = Sha256::digest(text.as_bytes());
                while vector.len() < self.dim {
                    for byte in digest.iter() {
                        if vector.len() == self.dim {
                            break;
                        }
                        vector.push(*byte as f32 - 127.5);
                    }
                    digest = Sha256::digest(digest);
                }
                l2_normalize(&mut vector);
                vector
            })
            .collect();

        Ok(EmbedOutput {
            vectors,
            total_tokens: estimate_tokens(texts),
        })
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
