//! Flat inner-product vector index.
//!
//! Vectors live in one contiguous buffer addressed by ordinal position
//! 0..N-1. Search is an exhaustive dot-product scan; with build-time
//! L2-normalized vectors the inner product equals cosine similarity.

use crate::index::IndexBuildError;

pub struct FlatIpIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIpIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn with_capacity(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            data: Vec::with_capacity(dimension * capacity),
        }
    }

    /// Reconstruct from a raw little-endian-decoded buffer (storage load).
    pub(crate) fn from_raw(dimension: usize, data: Vec<f32>) -> Option<Self> {
        if dimension == 0 || data.len() % dimension != 0 {
            return None;
        }
        Some(Self { dimension, data })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a vector, returning its ordinal.
    pub fn push(&mut self, id: &str, vector: &[f32]) -> Result<usize, IndexBuildError> {
        if vector.len() != self.dimension {
            return Err(IndexBuildError::DimensionMismatch {
                id: id.to_string(),
                expected: self.dimension,
                got: vector.len(),
            });
        }
        let ordinal = self.len();
        self.data.extend_from_slice(vector);
        Ok(ordinal)
    }

    pub fn vector(&self, ordinal: usize) -> Option<&[f32]> {
        let start = ordinal.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    pub(crate) fn raw_data(&self) -> &[f32] {
        &self.data
    }

    /// Exhaustive top-`m` search by inner product. Results are sorted by
    /// score descending; equal scores keep ascending ordinal order so
    /// rankings are reproducible.
    pub fn search(&self, query: &[f32], m: usize) -> Vec<(usize, f32)> {
        if query.len() != self.dimension || m == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(ordinal, vector)| {
                let dot: f32 = query.iter().zip(vector.iter()).map(|(a, b)| a * b).sum();
                (ordinal, dot)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(m);
        scored
    }
}
