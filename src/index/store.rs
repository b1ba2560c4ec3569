//! Process-wide holder of the current index generation.
//!
//! Readers grab an `Arc` to the generation and keep searching it even
//! while a rebuild swaps a newer one in. The read path never blocks on
//! a build.

use std::sync::{Arc, RwLock};

use crate::index::{GenerationStorage, GenerationStorageError, IndexGeneration};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no index generation loaded yet")]
    NotLoaded,

    #[error(transparent)]
    Storage(#[from] GenerationStorageError),

    #[error("index store lock poisoned")]
    Poisoned,
}

#[derive(Default)]
pub struct IndexStore {
    current: RwLock<Option<Arc<IndexGeneration>>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current generation, if any. The returned `Arc` stays valid
    /// across swaps.
    pub fn current(&self) -> Result<Arc<IndexGeneration>, StoreError> {
        self.current
            .read()
            .map_err(|_| StoreError::Poisoned)?
            .clone()
            .ok_or(StoreError::NotLoaded)
    }

    pub fn is_loaded(&self) -> bool {
        self.current
            .read()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Replace the current generation. In-flight searches holding the
    /// previous `Arc` finish against it undisturbed.
    pub fn swap(&self, generation: Arc<IndexGeneration>) -> Result<(), StoreError> {
        let mut guard = self.current.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(previous) = guard.as_ref() {
            log::info!(
                "swapping index generation: {} -> {} products",
                previous.len(),
                generation.len()
            );
        } else {
            log::info!("loading initial index generation: {} products", generation.len());
        }
        *guard = Some(generation);
        Ok(())
    }

    /// Load the persisted generation for `space_id` and swap it in.
    pub fn load_from(
        &self,
        storage: &GenerationStorage,
        space_id: &[u8; 32],
    ) -> Result<Arc<IndexGeneration>, StoreError> {
        let generation = Arc::new(storage.load(space_id)?);
        self.swap(Arc::clone(&generation))?;
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::EmbeddingVector;
    use serde_json::json;

    fn generation(ids: &[&str]) -> Arc<IndexGeneration> {
        let products = ids
            .iter()
            .map(|id| crate::catalog::normalize(&json!({"id": id, "title": format!("item {id}")})))
            .collect();
        let vectors = ids
            .iter()
            .enumerate()
            .map(|(i, _)| EmbeddingVector {
                values: vec![1.0, i as f32],
                provider: "test".to_string(),
                space: "test-space".to_string(),
            })
            .collect();
        Arc::new(crate::index::build(products, vectors).unwrap())
    }

    #[test]
    fn test_empty_store_is_not_loaded() {
        let store = IndexStore::new();
        assert!(!store.is_loaded());
        assert!(matches!(store.current(), Err(StoreError::NotLoaded)));
    }

    #[test]
    fn test_swap_makes_generation_current() {
        let store = IndexStore::new();
        store.swap(generation(&["a", "b"])).unwrap();
        assert!(store.is_loaded());
        assert_eq!(store.current().unwrap().len(), 2);
    }

    #[test]
    fn test_old_reference_survives_swap() {
        let store = IndexStore::new();
        store.swap(generation(&["a"])).unwrap();
        let held = store.current().unwrap();

        store.swap(generation(&["a", "b", "c"])).unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(store.current().unwrap().len(), 3);
    }
}
