//! Embedding providers behind uniform batch contracts.
//!
//! - `preprocess`: text cleanup applied before any provider sees input
//! - `local`: fastembed-backed text/image embedders (CLIP pair for the
//!   shared text/image space)
//! - `remote`: OpenAI-compatible HTTP embedding provider
//!
//! Provider selection is a configuration concern; the query and build
//! paths only see the [`TextEmbedder`] / [`ImageEmbedder`] traits and the
//! [`EmbedderChain`] fallback wrapper.

pub mod local;
pub mod preprocess;
pub mod remote;

pub use local::{LocalImageEmbedder, LocalTextEmbedder};
pub use remote::RemoteTextEmbedder;

/// Errors from embedding providers.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("empty embedding input")]
    EmptyInput,

    #[error("provider '{provider}' returned vector of dimension {got}, expected {expected}")]
    DimensionMismatch {
        provider: String,
        expected: usize,
        got: usize,
    },

    #[error("embedding spaces are incompatible: '{0}' vs '{1}'")]
    SpaceMismatch(String, String),

    #[error("cannot combine zero-norm query vectors")]
    ZeroNorm,

    #[error("model initialization failed: {0}")]
    InitFailed(String),

    #[error("invalid model name: {0}")]
    InvalidModel(String),

    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },
}

/// A fixed-dimension dense vector plus the provider and embedding space
/// that produced it. The space tag is what decides whether two vectors
/// may be compared or combined.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    pub values: Vec<f32>,
    pub provider: String,
    pub space: String,
}

impl EmbeddingVector {
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Scale to unit length. Zero-norm vectors are left untouched.
    pub fn normalize(&mut self) {
        let norm = self.norm();
        if norm > f32::EPSILON {
            for v in &mut self.values {
                *v /= norm;
            }
        }
    }
}

/// Batch text embedding. Deterministic for a fixed provider/model.
pub trait TextEmbedder: Send + Sync {
    /// Provider tag surfaced on every produced vector.
    fn provider(&self) -> &str;
    /// Embedding-space identifier (model name, shared across a CLIP pair).
    fn space(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed_text(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbedError>;
}

/// Batch image embedding over raw image bytes.
pub trait ImageEmbedder: Send + Sync {
    fn provider(&self) -> &str;
    fn space(&self) -> &str;
    fn dimensions(&self) -> usize;
    fn embed_image(&self, images: &[Vec<u8>]) -> Result<Vec<EmbeddingVector>, EmbedError>;
}

/// Preferred provider with an optional secondary. A provider failure or
/// a malformed (wrong-dimension) batch from the primary is retried once
/// against the fallback; everything else propagates.
pub struct EmbedderChain {
    primary: Box<dyn TextEmbedder>,
    fallback: Option<Box<dyn TextEmbedder>>,
}

impl EmbedderChain {
    /// Build a chain. The fallback must produce vectors of the same
    /// dimension as the primary or retrieval against one index would be
    /// meaningless.
    pub fn new(
        primary: Box<dyn TextEmbedder>,
        fallback: Option<Box<dyn TextEmbedder>>,
    ) -> Result<Self, EmbedError> {
        if let Some(fb) = &fallback {
            if fb.dimensions() != primary.dimensions() {
                return Err(EmbedError::DimensionMismatch {
                    provider: fb.provider().to_string(),
                    expected: primary.dimensions(),
                    got: fb.dimensions(),
                });
            }
        }
        Ok(Self { primary, fallback })
    }

    pub fn provider(&self) -> &str {
        self.primary.provider()
    }

    /// Space of the preferred provider. Vectors produced after a
    /// fallback carry the fallback's own space tag.
    pub fn space(&self) -> &str {
        self.primary.space()
    }

    pub fn dimensions(&self) -> usize {
        self.primary.dimensions()
    }

    /// SHA256 of the preferred space, used to pair persisted index
    /// generations with the embedder that built them.
    pub fn space_id_hash(&self) -> [u8; 32] {
        space_id_hash(self.space())
    }

    pub fn embed_text(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbedError> {
        if texts.is_empty() {
            return Err(EmbedError::EmptyInput);
        }

        let (vectors, provider) = match self.primary.embed_text(texts) {
            Ok(vectors) => (vectors, self.primary.provider()),
            Err(err @ (EmbedError::Provider { .. } | EmbedError::DimensionMismatch { .. })) => {
                let Some(fallback) = &self.fallback else {
                    return Err(err);
                };
                log::warn!(
                    "embedding provider '{}' failed ({err}), falling back to '{}'",
                    self.primary.provider(),
                    fallback.provider()
                );
                (fallback.embed_text(texts)?, fallback.provider())
            }
            Err(err) => return Err(err),
        };

        if vectors.len() != texts.len() {
            return Err(EmbedError::Provider {
                provider: provider.to_string(),
                message: format!(
                    "got {} embeddings for {} inputs",
                    vectors.len(),
                    texts.len()
                ),
            });
        }
        Ok(vectors)
    }
}

/// SHA256 of an embedding-space identifier.
pub fn space_id_hash(space: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(space.as_bytes());
    hasher.finalize().into()
}

/// Combine a text and an image query vector into one query vector:
/// weighted average in their shared space, then L2 renormalization.
///
/// Both vectors must come from the same embedding space; mixing spaces
/// produces garbage rankings, so a mismatch is an error rather than a
/// silent degradation.
pub fn combine_query_vectors(
    text: &EmbeddingVector,
    image: &EmbeddingVector,
    text_weight: f32,
) -> Result<EmbeddingVector, EmbedError> {
    if text.space != image.space {
        return Err(EmbedError::SpaceMismatch(
            text.space.clone(),
            image.space.clone(),
        ));
    }
    if text.dimension() != image.dimension() {
        return Err(EmbedError::DimensionMismatch {
            provider: image.provider.clone(),
            expected: text.dimension(),
            got: image.dimension(),
        });
    }

    let w = text_weight.clamp(0.0, 1.0);
    let values: Vec<f32> = text
        .values
        .iter()
        .zip(image.values.iter())
        .map(|(t, i)| w * t + (1.0 - w) * i)
        .collect();

    let mut combined = EmbeddingVector {
        values,
        provider: text.provider.clone(),
        space: text.space.clone(),
    };
    if combined.norm() <= f32::EPSILON {
        return Err(EmbedError::ZeroNorm);
    }
    combined.normalize();
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Mode {
        Healthy,
        Unavailable,
        WrongDimension,
        ShortBatch,
    }

    struct FixedEmbedder {
        provider: &'static str,
        space: &'static str,
        dims: usize,
        mode: Mode,
    }

    impl TextEmbedder for FixedEmbedder {
        fn provider(&self) -> &str {
            self.provider
        }
        fn space(&self) -> &str {
            self.space
        }
        fn dimensions(&self) -> usize {
            self.dims
        }
        fn embed_text(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbedError> {
            match self.mode {
                Mode::Unavailable => {
                    return Err(EmbedError::Provider {
                        provider: self.provider.to_string(),
                        message: "unavailable".to_string(),
                    })
                }
                Mode::WrongDimension => {
                    return Err(EmbedError::DimensionMismatch {
                        provider: self.provider.to_string(),
                        expected: self.dims,
                        got: self.dims + 1,
                    })
                }
                Mode::Healthy | Mode::ShortBatch => {}
            }
            let count = match self.mode {
                Mode::ShortBatch => texts.len().saturating_sub(1),
                _ => texts.len(),
            };
            Ok((0..count)
                .map(|_| EmbeddingVector {
                    values: vec![1.0; self.dims],
                    provider: self.provider.to_string(),
                    space: self.space.to_string(),
                })
                .collect())
        }
    }

    fn boxed(provider: &'static str, dims: usize, mode: Mode) -> Box<dyn TextEmbedder> {
        Box::new(FixedEmbedder {
            provider,
            space: "test-space",
            dims,
            mode,
        })
    }

    #[test]
    fn test_chain_empty_input_rejected() {
        let chain = EmbedderChain::new(boxed("a", 4, Mode::Healthy), None).unwrap();
        assert!(matches!(chain.embed_text(&[]), Err(EmbedError::EmptyInput)));
    }

    #[test]
    fn test_chain_uses_primary() {
        let chain = EmbedderChain::new(
            boxed("a", 4, Mode::Healthy),
            Some(boxed("b", 4, Mode::Healthy)),
        )
        .unwrap();
        let vectors = chain.embed_text(&["x".to_string()]).unwrap();
        assert_eq!(vectors[0].provider, "a");
    }

    #[test]
    fn test_chain_falls_back_on_provider_error() {
        let chain = EmbedderChain::new(
            boxed("a", 4, Mode::Unavailable),
            Some(boxed("b", 4, Mode::Healthy)),
        )
        .unwrap();
        let vectors = chain.embed_text(&["x".to_string()]).unwrap();
        assert_eq!(vectors[0].provider, "b");
    }

    #[test]
    fn test_chain_falls_back_on_malformed_vector() {
        let chain = EmbedderChain::new(
            boxed("a", 4, Mode::WrongDimension),
            Some(boxed("b", 4, Mode::Healthy)),
        )
        .unwrap();
        let vectors = chain.embed_text(&["x".to_string()]).unwrap();
        assert_eq!(vectors[0].provider, "b");
    }

    #[test]
    fn test_chain_surfaces_error_without_fallback() {
        let chain = EmbedderChain::new(boxed("a", 4, Mode::Unavailable), None).unwrap();
        let result = chain.embed_text(&["x".to_string()]);
        assert!(matches!(result, Err(EmbedError::Provider { .. })));

        let chain = EmbedderChain::new(boxed("a", 4, Mode::WrongDimension), None).unwrap();
        let result = chain.embed_text(&["x".to_string()]);
        assert!(matches!(result, Err(EmbedError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_chain_rejects_short_batch() {
        let chain = EmbedderChain::new(boxed("a", 4, Mode::ShortBatch), None).unwrap();
        let result = chain.embed_text(&["x".to_string(), "y".to_string()]);
        assert!(matches!(result, Err(EmbedError::Provider { .. })));
    }

    #[test]
    fn test_chain_rejects_dimension_mismatch() {
        let result = EmbedderChain::new(
            boxed("a", 4, Mode::Healthy),
            Some(boxed("b", 8, Mode::Healthy)),
        );
        assert!(matches!(result, Err(EmbedError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_combine_averages_and_normalizes() {
        let text = EmbeddingVector {
            values: vec![1.0, 0.0],
            provider: "p".into(),
            space: "s".into(),
        };
        let image = EmbeddingVector {
            values: vec![0.0, 1.0],
            provider: "p".into(),
            space: "s".into(),
        };
        let combined = combine_query_vectors(&text, &image, 0.5).unwrap();
        assert!((combined.norm() - 1.0).abs() < 1e-6);
        assert!((combined.values[0] - combined.values[1]).abs() < 1e-6);
    }

    #[test]
    fn test_combine_rejects_space_mismatch() {
        let text = EmbeddingVector {
            values: vec![1.0],
            provider: "p".into(),
            space: "text-space".into(),
        };
        let image = EmbeddingVector {
            values: vec![1.0],
            provider: "p".into(),
            space: "image-space".into(),
        };
        let result = combine_query_vectors(&text, &image, 0.5);
        assert!(matches!(result, Err(EmbedError::SpaceMismatch(_, _))));
    }

    #[test]
    fn test_space_id_hash_is_stable() {
        assert_eq!(space_id_hash("clip-vit-b-32"), space_id_hash("clip-vit-b-32"));
        assert_ne!(space_id_hash("a"), space_id_hash("b"));
    }
}
