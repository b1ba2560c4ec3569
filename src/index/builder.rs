//! Index generation construction.
//!
//! Consumes normalized products and their embedding vectors, validates
//! the pairing, L2-normalizes every vector (so inner-product search is
//! cosine ranking without query-time work), and assigns ordinals in
//! input order.

use chrono::Utc;
use rayon::prelude::*;
use std::collections::HashSet;

use crate::catalog::Product;
use crate::embed::EmbeddingVector;
use crate::index::{FlatIpIndex, IndexBuildError, IndexGeneration};

/// Build an immutable [`IndexGeneration`] from parallel product/vector
/// sequences. `products[i]` gets ordinal `i`.
pub fn build(
    products: Vec<Product>,
    vectors: Vec<EmbeddingVector>,
) -> Result<IndexGeneration, IndexBuildError> {
    if products.is_empty() || vectors.is_empty() {
        return Err(IndexBuildError::EmptyInput);
    }
    if products.len() != vectors.len() {
        return Err(IndexBuildError::LengthMismatch {
            products: products.len(),
            vectors: vectors.len(),
        });
    }

    let space = vectors[0].space.clone();
    if let Some(stray) = vectors.iter().find(|v| v.space != space) {
        return Err(IndexBuildError::MixedSpaces(space, stray.space.clone()));
    }

    let dimension = vectors[0].dimension();
    let mut seen = HashSet::with_capacity(products.len());
    for product in &products {
        if !seen.insert(product.id.as_str()) {
            return Err(IndexBuildError::DuplicateId(product.id.clone()));
        }
    }

    // Normalize up front; zero-norm vectors cannot participate in
    // cosine ranking.
    let normalized: Vec<Vec<f32>> = products
        .par_iter()
        .zip(vectors.into_par_iter())
        .map(|(product, mut vector)| {
            if vector.dimension() != dimension {
                return Err(IndexBuildError::DimensionMismatch {
                    id: product.id.clone(),
                    expected: dimension,
                    got: vector.dimension(),
                });
            }
            if vector.norm() <= f32::EPSILON {
                return Err(IndexBuildError::ZeroNorm {
                    id: product.id.clone(),
                });
            }
            vector.normalize();
            Ok(vector.values)
        })
        .collect::<Result<_, _>>()?;

    let mut index = FlatIpIndex::with_capacity(dimension, products.len());
    for (product, values) in products.iter().zip(normalized.iter()) {
        index.push(&product.id, values)?;
    }

    log::info!(
        "built index generation: {} vectors, dimension {}, space '{}'",
        products.len(),
        dimension,
        space
    );

    Ok(IndexGeneration::from_parts(
        index,
        products,
        space,
        Utc::now(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product(id: &str) -> Product {
        crate::catalog::normalize(&json!({"id": id, "title": format!("item {id}")}))
    }

    fn vector(values: Vec<f32>) -> EmbeddingVector {
        EmbeddingVector {
            values,
            provider: "test".to_string(),
            space: "test-space".to_string(),
        }
    }

    #[test]
    fn test_build_assigns_ordinals_in_input_order() {
        let generation = build(
            vec![product("a"), product("b")],
            vec![vector(vec![1.0, 0.0]), vector(vec![0.0, 1.0])],
        )
        .unwrap();

        let ids: Vec<&str> = generation.ordinal_to_id().collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(generation.len(), 2);
        assert_eq!(generation.dimension(), 2);
        assert_eq!(generation.space(), "test-space");
    }

    #[test]
    fn test_build_normalizes_vectors() {
        let generation = build(vec![product("a")], vec![vector(vec![3.0, 4.0])]).unwrap();
        let stored = generation.index().vector(0).unwrap();
        let norm: f32 = stored.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_build_rejects_empty_input() {
        assert!(matches!(build(vec![], vec![]), Err(IndexBuildError::EmptyInput)));
    }

    #[test]
    fn test_build_rejects_length_mismatch() {
        let result = build(vec![product("a")], vec![
            vector(vec![1.0]),
            vector(vec![1.0]),
        ]);
        assert!(matches!(result, Err(IndexBuildError::LengthMismatch { .. })));
    }

    #[test]
    fn test_build_rejects_dimension_mismatch() {
        let result = build(
            vec![product("a"), product("b")],
            vec![vector(vec![1.0, 0.0]), vector(vec![1.0])],
        );
        assert!(matches!(result, Err(IndexBuildError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_build_rejects_duplicate_ids() {
        let result = build(
            vec![product("a"), product("a")],
            vec![vector(vec![1.0]), vector(vec![1.0])],
        );
        assert!(matches!(result, Err(IndexBuildError::DuplicateId(_))));
    }

    #[test]
    fn test_build_rejects_zero_norm() {
        let result = build(vec![product("a")], vec![vector(vec![0.0, 0.0])]);
        assert!(matches!(result, Err(IndexBuildError::ZeroNorm { .. })));
    }

    #[test]
    fn test_build_rejects_mixed_spaces() {
        let mut other = vector(vec![1.0]);
        other.space = "other-space".to_string();
        let result = build(vec![product("a"), product("b")], vec![vector(vec![1.0]), other]);
        assert!(matches!(result, Err(IndexBuildError::MixedSpaces(_, _))));
    }
}
