//! Cross-encoder reranking stage.
//!
//! Scores each (query, candidate document) pair jointly instead of
//! comparing pre-computed vectors, which is slower but notably more
//! accurate on the handful of candidates that survive retrieval. The
//! stage is strictly optional: callers treat any failure here as a
//! signal to keep the vector-search ordering.

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::catalog::Product;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum RerankError {
    #[error("Reranker initialization failed: {0}")]
    InitFailed(String),

    #[error("Reranking failed: {0}")]
    RerankFailed(String),

    #[error("Invalid reranker model name: {0}")]
    InvalidModel(String),
}

/// A reranker takes the query and `(id, document)` candidates and
/// returns `(id, score)` pairs sorted best-first. Implementations must
/// return exactly one entry per candidate.
pub trait Reranker: Send + Sync {
    fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> Result<Vec<(String, f32)>, RerankError>;
}

/// Wrapper around fastembed's TextRerank cross-encoder.
/// Uses a Mutex because fastembed's rerank() requires &mut self.
pub struct CrossEncoderReranker {
    model: Mutex<TextRerank>,
    model_name: String,
}

impl CrossEncoderReranker {
    /// Load a cross-encoder model, downloading it on first use.
    /// Models are cached in the `models/` subdirectory of `cache_dir`.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, RerankError> {
        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            RerankError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        let options = RerankInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let model =
            TextRerank::try_new(options).map_err(|e| RerankError::InitFailed(e.to_string()))?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    fn parse_model_name(name: &str) -> Result<RerankerModel, RerankError> {
        match name.to_lowercase().as_str() {
            "bge-reranker-base" | "bgererankerbase" => Ok(RerankerModel::BGERerankerBase),
            "jina-reranker-v1-turbo-en" | "jinarerankerv1turboen" => {
                Ok(RerankerModel::JINARerankerV1TurboEn)
            }
            _ => Err(RerankError::InvalidModel(format!(
                "Unknown reranker: {}. Supported models: bge-reranker-base, jina-reranker-v1-turbo-en",
                name
            ))),
        }
    }
}

impl Reranker for CrossEncoderReranker {
    fn rerank(
        &self,
        query: &str,
        candidates: &[(String, String)],
    ) -> Result<Vec<(String, f32)>, RerankError> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            RerankError::RerankFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let documents: Vec<&str> = candidates.iter().map(|(_, doc)| doc.as_str()).collect();
        let results = model
            .rerank(query, documents, false, None)
            .map_err(|e| RerankError::RerankFailed(e.to_string()))?;

        if results.len() != candidates.len() {
            return Err(RerankError::RerankFailed(format!(
                "got {} scores for {} candidates",
                results.len(),
                candidates.len()
            )));
        }

        // fastembed returns results sorted by score with the original
        // position in `index`.
        Ok(results
            .into_iter()
            .map(|r| (candidates[r.index].0.clone(), r.score))
            .collect())
    }
}

/// Assemble the document the cross-encoder sees for a product: the same
/// descriptive fields the retrieval text uses, minus the price/rating
/// suffixes that only help vector recall.
pub fn candidate_text(product: &Product) -> String {
    let mut parts: Vec<String> = vec![product.title.clone()];

    for key in ["features", "categories", "description", "product_description"] {
        if let Some(value) = product.raw.get(key) {
            match value {
                serde_json::Value::String(s) if !s.trim().is_empty() => {
                    parts.push(s.trim().to_string());
                }
                serde_json::Value::Array(items) => {
                    for item in items {
                        if let Some(s) = item.as_str() {
                            if !s.trim().is_empty() {
                                parts.push(s.trim().to_string());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let joined = parts.join(" . ");
    WHITESPACE_RE.replace_all(&joined, " ").trim().to_string()
}
