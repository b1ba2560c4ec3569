//! ANN index generations.
//!
//! - `flat`: flat inner-product vector index addressed by ordinal
//! - `builder`: validated construction of an [`IndexGeneration`]
//! - `storage`: atomic persistence of the blob + side-table pair
//! - `store`: process-wide holder of the current generation
//!
//! A generation is immutable once built; rebuilds produce a new
//! generation that the store swaps in atomically.

pub mod builder;
pub mod flat;
pub mod storage;
pub mod store;

pub use builder::build;
pub use flat::FlatIpIndex;
pub use storage::{GenerationStorage, GenerationStorageError};
pub use store::{IndexStore, StoreError};

use chrono::{DateTime, Utc};

use crate::catalog::Product;

/// Fatal build-time errors. A generation that fails to build is never
/// swapped into the store.
#[derive(Debug, thiserror::Error)]
pub enum IndexBuildError {
    #[error("cannot build an index from an empty catalog")]
    EmptyInput,

    #[error("{products} products but {vectors} vectors")]
    LengthMismatch { products: usize, vectors: usize },

    #[error("vector for product '{id}' has dimension {got}, expected {expected}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        got: usize,
    },

    #[error("duplicate product id '{0}'")]
    DuplicateId(String),

    #[error("vector for product '{id}' has zero norm")]
    ZeroNorm { id: String },

    #[error("vectors mix embedding spaces: '{0}' vs '{1}'")]
    MixedSpaces(String, String),
}

/// One immutable, fully built index version: the vector index plus the
/// ordinal-aligned product side table. Ordinal `i` in the index always
/// refers to `products[i]`.
pub struct IndexGeneration {
    index: FlatIpIndex,
    products: Vec<Product>,
    space: String,
    built_at: DateTime<Utc>,
}

impl IndexGeneration {
    pub(crate) fn from_parts(
        index: FlatIpIndex,
        products: Vec<Product>,
        space: String,
        built_at: DateTime<Utc>,
    ) -> Self {
        debug_assert_eq!(index.len(), products.len());
        Self {
            index,
            products,
            space,
            built_at,
        }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension()
    }

    /// Embedding space the generation's vectors live in.
    pub fn space(&self) -> &str {
        &self.space
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn product(&self, ordinal: usize) -> Option<&Product> {
        self.products.get(ordinal)
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    /// Ordinal → product id mapping, in ordinal order.
    pub fn ordinal_to_id(&self) -> impl Iterator<Item = &str> {
        self.products.iter().map(|p| p.id.as_str())
    }

    pub(crate) fn index(&self) -> &FlatIpIndex {
        &self.index
    }

    /// Top-`m` ordinals by inner product against `query`, scores
    /// descending, ties broken by ordinal.
    pub fn search(&self, query: &[f32], m: usize) -> Vec<(usize, f32)> {
        self.index.search(query, m)
    }
}
