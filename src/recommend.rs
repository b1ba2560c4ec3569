//! Query processing: request validation, query-vector resolution,
//! oversampled retrieval, post-filtering, and optional reranking.
//!
//! Ranking invariants the web layer relies on:
//! - ranks are 1-based and contiguous
//! - scores are non-increasing in rank order
//! - a restrictive filter yields fewer (possibly zero) results, never
//!   an error

use std::sync::Arc;

use crate::catalog::{Gender, Product};
use crate::embed::{
    combine_query_vectors, preprocess, EmbedError, EmbedderChain, EmbeddingVector, ImageEmbedder,
};
use crate::index::{IndexGeneration, IndexStore, StoreError};
use crate::rerank::{candidate_text, Reranker};

#[derive(Debug, thiserror::Error)]
pub enum RecommendError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Embedding(#[from] EmbedError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Structured post-filters. All present fields must match.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub gender: Option<Gender>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub min_rating: Option<f64>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.gender.is_none()
            && self.min_price.is_none()
            && self.max_price.is_none()
            && self.min_rating.is_none()
    }

    /// Whether a product passes every present filter. Products missing a
    /// filtered field fail that filter.
    pub fn matches(&self, product: &Product) -> bool {
        if let Some(gender) = self.gender {
            if !gender_matches(gender, product.gender) {
                return false;
            }
        }
        if let Some(min) = self.min_price {
            match product.price {
                Some(price) if price >= min => {}
                _ => return false,
            }
        }
        if let Some(max) = self.max_price {
            match product.price {
                Some(price) if price <= max => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_rating {
            match product.rating {
                Some(rating) if rating >= min => {}
                _ => return false,
            }
        }
        true
    }
}

/// A gendered filter admits the exact gender plus unisex items; items
/// whose gender could not be determined are excluded.
fn gender_matches(wanted: Gender, actual: Gender) -> bool {
    actual == wanted || actual == Gender::Unisex
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_text: Option<String>,
    pub query_image: Option<Vec<u8>>,
    pub top_k: Option<usize>,
    pub rerank: bool,
    pub filters: Filters,
}

#[derive(Debug, Clone)]
pub struct ScoredResult {
    pub product: Product,
    pub score: f32,
    pub rank: usize,
}

/// A full recommendation response: the ranked results plus which
/// embedding provider produced the query vector and whether the
/// cross-encoder ordering actually applied.
#[derive(Debug)]
pub struct Recommendation {
    pub results: Vec<ScoredResult>,
    pub provider: String,
    pub reranked: bool,
}

#[derive(Debug, Clone)]
pub struct RecommenderOptions {
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// Retrieval oversampling multiplier when reranking.
    pub rerank_factor: usize,
    /// Retrieval oversampling multiplier when post-filters are active.
    pub filter_factor: usize,
    /// Text weight when combining text and image query vectors.
    pub text_weight: f32,
}

impl Default for RecommenderOptions {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            max_top_k: 100,
            rerank_factor: 4,
            filter_factor: 3,
            text_weight: 0.5,
        }
    }
}

pub struct Recommender {
    store: Arc<IndexStore>,
    text_embedder: EmbedderChain,
    image_embedder: Option<Box<dyn ImageEmbedder>>,
    reranker: Option<Box<dyn Reranker>>,
    opts: RecommenderOptions,
}

impl Recommender {
    pub fn new(
        store: Arc<IndexStore>,
        text_embedder: EmbedderChain,
        image_embedder: Option<Box<dyn ImageEmbedder>>,
        reranker: Option<Box<dyn Reranker>>,
        opts: RecommenderOptions,
    ) -> Self {
        Self {
            store,
            text_embedder,
            image_embedder,
            reranker,
            opts,
        }
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn recommend(&self, request: &SearchRequest) -> Result<Recommendation, RecommendError> {
        let top_k = self.validate(request)?;

        let generation = self.store.current()?;
        let (query, provider) = self.resolve_query_vector(request)?;

        if query.space != generation.space() {
            log::warn!(
                "query vector space '{}' differs from index space '{}'",
                query.space,
                generation.space()
            );
        }

        let want_rerank = request.rerank && self.reranker.is_some();
        let detected_gender = self.detect_gender(request);
        let filtering = !request.filters.is_empty() || detected_gender.is_some();

        // Oversample so post-filters and the reranker have candidates to
        // work with.
        let mut m = top_k;
        if want_rerank {
            m = m.max(top_k * self.opts.rerank_factor);
        }
        if filtering {
            m = m.max(top_k * self.opts.filter_factor);
        }
        m = m.min(generation.len());

        let hits = generation.search(&query.values, m);
        let mut candidates: Vec<(usize, f32)> = hits
            .into_iter()
            .filter(|(ordinal, _)| {
                generation
                    .product(*ordinal)
                    .map(|p| request.filters.matches(p))
                    .unwrap_or(false)
            })
            .collect();

        // A gender inferred from query wording is advisory: apply it only
        // when enough candidates survive to fill the page, so it never
        // empties results the way an explicit filter may.
        if let Some(gender) = detected_gender {
            let gendered: Vec<(usize, f32)> = candidates
                .iter()
                .filter(|(ordinal, _)| {
                    generation
                        .product(*ordinal)
                        .map(|p| gender_matches(gender, p.gender))
                        .unwrap_or(false)
                })
                .copied()
                .collect();
            if gendered.len() >= top_k {
                candidates = gendered;
            } else {
                log::debug!(
                    "detected gender {:?} leaves {} of {} candidates, keeping all",
                    gender,
                    gendered.len(),
                    candidates.len()
                );
            }
        }

        let mut reranked = false;
        if want_rerank {
            match self.apply_rerank(request, &generation, &candidates) {
                Ok(Some(ordered)) => {
                    candidates = ordered;
                    reranked = true;
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!("reranking failed, keeping vector-search order: {err}");
                }
            }
        }

        candidates.truncate(top_k);
        let results = candidates
            .into_iter()
            .enumerate()
            .map(|(i, (ordinal, score))| {
                let product = generation
                    .product(ordinal)
                    .cloned()
                    .ok_or_else(|| RecommendError::Internal(format!("dangling ordinal {ordinal}")))?;
                Ok(ScoredResult {
                    product,
                    score,
                    rank: i + 1,
                })
            })
            .collect::<Result<Vec<_>, RecommendError>>()?;

        Ok(Recommendation {
            results,
            provider,
            reranked,
        })
    }

    fn validate(&self, request: &SearchRequest) -> Result<usize, RecommendError> {
        let has_text = request
            .query_text
            .as_deref()
            .map(|t| !t.trim().is_empty())
            .unwrap_or(false);
        if !has_text && request.query_image.is_none() {
            return Err(RecommendError::InvalidRequest(
                "at least one of query text or query image is required".to_string(),
            ));
        }

        let top_k = request.top_k.unwrap_or(self.opts.default_top_k);
        if top_k == 0 {
            return Err(RecommendError::InvalidRequest(
                "top_k must be positive".to_string(),
            ));
        }
        if top_k > self.opts.max_top_k {
            return Err(RecommendError::InvalidRequest(format!(
                "top_k {} exceeds maximum {}",
                top_k, self.opts.max_top_k
            )));
        }

        if let (Some(min), Some(max)) = (request.filters.min_price, request.filters.max_price) {
            if min > max {
                return Err(RecommendError::InvalidRequest(
                    "min_price exceeds max_price".to_string(),
                ));
            }
        }
        for price in [request.filters.min_price, request.filters.max_price]
            .into_iter()
            .flatten()
        {
            if !price.is_finite() || price < 0.0 {
                return Err(RecommendError::InvalidRequest(
                    "price filters must be non-negative".to_string(),
                ));
            }
        }
        if let Some(rating) = request.filters.min_rating {
            if !rating.is_finite() || !(0.0..=5.0).contains(&rating) {
                return Err(RecommendError::InvalidRequest(
                    "min_rating must be within 0..=5".to_string(),
                ));
            }
        }

        if request.query_image.is_some() && self.image_embedder.is_none() {
            return Err(RecommendError::InvalidRequest(
                "image queries are not enabled".to_string(),
            ));
        }
        if let Some(bytes) = &request.query_image {
            if image::load_from_memory(bytes).is_err() {
                return Err(RecommendError::InvalidRequest(
                    "query image is not a decodable image".to_string(),
                ));
            }
        }

        Ok(top_k)
    }

    /// Embed whichever query modalities are present and combine them
    /// into a single unit-length vector. Returns the vector and the
    /// provider tag that produced it.
    fn resolve_query_vector(
        &self,
        request: &SearchRequest,
    ) -> Result<(EmbeddingVector, String), RecommendError> {
        let text_vector = match request.query_text.as_deref() {
            Some(text) if !text.trim().is_empty() => {
                let prepared = preprocess::prepare(text);
                let vectors = self.text_embedder.embed_text(&[prepared])?;
                Some(vectors.into_iter().next().ok_or_else(|| {
                    EmbedError::Provider {
                        provider: self.text_embedder.provider().to_string(),
                        message: "empty embedding batch for query text".to_string(),
                    }
                })?)
            }
            _ => None,
        };

        let image_vector = match &request.query_image {
            Some(bytes) => {
                let embedder = self.image_embedder.as_ref().ok_or_else(|| {
                    RecommendError::InvalidRequest("image queries are not enabled".to_string())
                })?;
                let vectors = embedder.embed_image(std::slice::from_ref(bytes))?;
                Some(vectors.into_iter().next().ok_or_else(|| {
                    EmbedError::Provider {
                        provider: embedder.provider().to_string(),
                        message: "empty embedding batch for query image".to_string(),
                    }
                })?)
            }
            None => None,
        };

        let mut vector = match (text_vector, image_vector) {
            (Some(text), Some(image)) => {
                combine_query_vectors(&text, &image, self.opts.text_weight)?
            }
            (Some(text), None) => text,
            (None, Some(image)) => image,
            (None, None) => {
                return Err(RecommendError::InvalidRequest(
                    "at least one of query text or query image is required".to_string(),
                ))
            }
        };
        if vector.norm() <= f32::EPSILON {
            return Err(RecommendError::Embedding(EmbedError::ZeroNorm));
        }
        vector.normalize();

        let provider = vector.provider.clone();
        Ok((vector, provider))
    }

    fn detect_gender(&self, request: &SearchRequest) -> Option<Gender> {
        if request.filters.gender.is_some() {
            return None;
        }
        request
            .query_text
            .as_deref()
            .and_then(Gender::detect_query_intent)
    }

    /// Run the cross-encoder over the filtered candidates. `Ok(None)`
    /// means the stage does not apply (no text query to score against).
    fn apply_rerank(
        &self,
        request: &SearchRequest,
        generation: &IndexGeneration,
        candidates: &[(usize, f32)],
    ) -> Result<Option<Vec<(usize, f32)>>, crate::rerank::RerankError> {
        let Some(reranker) = &self.reranker else {
            return Ok(None);
        };
        let Some(query) = request.query_text.as_deref().filter(|t| !t.trim().is_empty()) else {
            log::debug!("skipping rerank: image-only query");
            return Ok(None);
        };
        if candidates.is_empty() {
            return Ok(None);
        }

        let documents: Vec<(String, String)> = candidates
            .iter()
            .filter_map(|(ordinal, _)| {
                generation
                    .product(*ordinal)
                    .map(|p| (ordinal.to_string(), candidate_text(p)))
            })
            .collect();

        let scored = reranker.rerank(query, &documents)?;
        let ordered = scored
            .into_iter()
            .filter_map(|(key, score)| key.parse::<usize>().ok().map(|ordinal| (ordinal, score)))
            .collect();
        Ok(Some(ordered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::TextEmbedder;
    use serde_json::json;

    fn product(value: serde_json::Value) -> Product {
        crate::catalog::normalize(&value)
    }

    struct StubTextEmbedder;

    impl TextEmbedder for StubTextEmbedder {
        fn provider(&self) -> &str {
            "stub"
        }
        fn space(&self) -> &str {
            "stub-space"
        }
        fn dimensions(&self) -> usize {
            4
        }
        fn embed_text(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbedError> {
            Ok(texts
                .iter()
                .map(|_| EmbeddingVector {
                    values: vec![1.0, 0.0, 0.0, 0.0],
                    provider: "stub".to_string(),
                    space: "stub-space".to_string(),
                })
                .collect())
        }
    }

    /// Misbehaving image provider: returns no vectors for a one-image batch.
    struct EmptyBatchImageEmbedder;

    impl ImageEmbedder for EmptyBatchImageEmbedder {
        fn provider(&self) -> &str {
            "stub-image"
        }
        fn space(&self) -> &str {
            "stub-space"
        }
        fn dimensions(&self) -> usize {
            4
        }
        fn embed_image(&self, _images: &[Vec<u8>]) -> Result<Vec<EmbeddingVector>, EmbedError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_empty_image_batch_is_a_provider_error() {
        let recommender = Recommender::new(
            Arc::new(IndexStore::default()),
            EmbedderChain::new(Box::new(StubTextEmbedder), None).unwrap(),
            Some(Box::new(EmptyBatchImageEmbedder)),
            None,
            RecommenderOptions::default(),
        );
        let request = SearchRequest {
            query_text: None,
            query_image: Some(vec![0u8; 8]),
            top_k: None,
            rerank: false,
            filters: Filters::default(),
        };
        let result = recommender.resolve_query_vector(&request);
        assert!(matches!(
            result,
            Err(RecommendError::Embedding(EmbedError::Provider { .. }))
        ));
    }

    #[test]
    fn test_filters_empty_matches_everything() {
        let filters = Filters::default();
        assert!(filters.is_empty());
        assert!(filters.matches(&product(json!({"id": "a", "title": "t"}))));
    }

    #[test]
    fn test_price_filter_excludes_missing_price() {
        let filters = Filters {
            min_price: Some(10.0),
            ..Default::default()
        };
        assert!(!filters.matches(&product(json!({"id": "a", "title": "t"}))));
        assert!(filters.matches(&product(json!({"id": "b", "title": "t", "price": 15.0}))));
        assert!(!filters.matches(&product(json!({"id": "c", "title": "t", "price": 5.0}))));
    }

    #[test]
    fn test_price_range_is_inclusive() {
        let filters = Filters {
            min_price: Some(10.0),
            max_price: Some(20.0),
            ..Default::default()
        };
        assert!(filters.matches(&product(json!({"id": "a", "title": "t", "price": 10.0}))));
        assert!(filters.matches(&product(json!({"id": "b", "title": "t", "price": 20.0}))));
        assert!(!filters.matches(&product(json!({"id": "c", "title": "t", "price": 20.01}))));
    }

    #[test]
    fn test_rating_filter() {
        let filters = Filters {
            min_rating: Some(4.0),
            ..Default::default()
        };
        assert!(filters.matches(&product(json!({"id": "a", "title": "t", "rating": 4.5}))));
        assert!(!filters.matches(&product(json!({"id": "b", "title": "t", "rating": 3.9}))));
        assert!(!filters.matches(&product(json!({"id": "c", "title": "t"}))));
    }

    #[test]
    fn test_gender_filter_admits_unisex() {
        let filters = Filters {
            gender: Some(Gender::Women),
            ..Default::default()
        };
        assert!(filters.matches(&product(json!({"id": "a", "title": "women's dress"}))));
        assert!(filters.matches(&product(json!({"id": "b", "title": "unisex scarf"}))));
        assert!(!filters.matches(&product(json!({"id": "c", "title": "men's boots"}))));
        // undetermined gender is excluded under an explicit filter
        assert!(!filters.matches(&product(json!({"id": "d", "title": "scarf"}))));
    }
}
