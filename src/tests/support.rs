//! Deterministic test doubles: a bag-of-words hashing embedder so the
//! engine can be exercised without model downloads, plus canned
//! rerankers.

use crate::embed::{EmbedError, EmbeddingVector, TextEmbedder};
use crate::rerank::{RerankError, Reranker};

pub const DIMS: usize = 4096;
pub const SPACE: &str = "hash-space";
pub const PROVIDER: &str = "hash";

/// Token-count vector: each lowercase whitespace token bumps one slot.
/// Documents sharing more query tokens score higher after cosine
/// normalization, which is all the ranking tests need.
pub fn hash_vector(text: &str, dims: usize) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut values = vec![0f32; dims];
    for token in text.to_lowercase().split_whitespace() {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        values[(hasher.finish() as usize) % dims] += 1.0;
    }
    values
}

#[derive(Default)]
pub struct HashTextEmbedder;

impl TextEmbedder for HashTextEmbedder {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn space(&self) -> &str {
        SPACE
    }

    fn dimensions(&self) -> usize {
        DIMS
    }

    fn embed_text(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbedError> {
        if texts.is_empty() {
            return Err(EmbedError::EmptyInput);
        }
        Ok(texts
            .iter()
            .map(|text| EmbeddingVector {
                values: hash_vector(text, DIMS),
                provider: PROVIDER.to_string(),
                space: SPACE.to_string(),
            })
            .collect())
    }
}

/// Always errors, for exercising the degradation path.
pub struct FailingReranker;

impl Reranker for FailingReranker {
    fn rerank(
        &self,
        _query: &str,
        _candidates: &[(String, String)],
    ) -> Result<Vec<(String, f32)>, RerankError> {
        Err(RerankError::RerankFailed("model unavailable".to_string()))
    }
}

/// Returns the candidates in reverse order with strictly decreasing
/// scores, making a successful rerank observable.
pub struct ReverseReranker;

impl Reranker for ReverseReranker {
    fn rerank(
        &self,
        _query: &str,
        candidates: &[(String, String)],
    ) -> Result<Vec<(String, f32)>, RerankError> {
        Ok(candidates
            .iter()
            .rev()
            .enumerate()
            .map(|(i, (id, _))| (id.clone(), 1.0 - i as f32 * 0.01))
            .collect())
    }
}
