//! Local embedding providers backed by fastembed.
//!
//! Models are downloaded on first use into `<cache_dir>/models`. Text and
//! image embedders report an embedding-space tag; the CLIP text/image pair
//! shares one space, which is what makes mixed text+image queries valid.

use fastembed::{
    ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding,
};
use image::ImageFormat;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::embed::{EmbedError, EmbeddingVector, ImageEmbedder, TextEmbedder};

/// Provider tag for everything produced by this module.
pub const PROVIDER: &str = "fastembed";

/// Space shared by the CLIP text and image models.
const CLIP_SPACE: &str = "clip-vit-b-32";

/// Text embedder wrapping fastembed's `TextEmbedding`.
/// The model sits behind a Mutex because fastembed needs `&mut self`.
pub struct LocalTextEmbedder {
    model: Mutex<TextEmbedding>,
    space: String,
    dimensions: usize,
}

impl LocalTextEmbedder {
    /// Load (downloading if needed) the named text model.
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbedError> {
        let (model_enum, space) = parse_text_model(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir)
            .map_err(|e| EmbedError::InitFailed(format!("cannot create models dir: {e}")))?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);
        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbedError::InitFailed(e.to_string()))?;

        let dimensions = probe_text_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            space,
            dimensions,
        })
    }
}

impl TextEmbedder for LocalTextEmbedder {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn space(&self) -> &str {
        &self.space
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_text(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>, EmbedError> {
        if texts.is_empty() {
            return Err(EmbedError::EmptyInput);
        }

        let mut model = self.model.lock().map_err(|e| EmbedError::Provider {
            provider: PROVIDER.to_string(),
            message: format!("model lock poisoned: {e}"),
        })?;

        let raw = model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbedError::Provider {
                provider: PROVIDER.to_string(),
                message: e.to_string(),
            })?;

        self.tag_and_check(raw)
    }
}

impl LocalTextEmbedder {
    fn tag_and_check(&self, raw: Vec<Vec<f32>>) -> Result<Vec<EmbeddingVector>, EmbedError> {
        raw.into_iter()
            .map(|values| {
                if values.len() != self.dimensions {
                    return Err(EmbedError::DimensionMismatch {
                        provider: PROVIDER.to_string(),
                        expected: self.dimensions,
                        got: values.len(),
                    });
                }
                Ok(EmbeddingVector {
                    values,
                    provider: PROVIDER.to_string(),
                    space: self.space.clone(),
                })
            })
            .collect()
    }
}

/// Image embedder wrapping fastembed's `ImageEmbedding`.
///
/// fastembed reads images from paths, so incoming bytes are decoded
/// (validating them in the process) and staged through temp files.
pub struct LocalImageEmbedder {
    model: Mutex<ImageEmbedding>,
    space: String,
    dimensions: usize,
}

impl LocalImageEmbedder {
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbedError> {
        let (model_enum, space) = parse_image_model(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir)
            .map_err(|e| EmbedError::InitFailed(format!("cannot create models dir: {e}")))?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);
        let mut model = ImageEmbedding::try_new(options)
            .map_err(|e| EmbedError::InitFailed(e.to_string()))?;

        let dimensions = probe_image_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            space,
            dimensions,
        })
    }
}

impl ImageEmbedder for LocalImageEmbedder {
    fn provider(&self) -> &str {
        PROVIDER
    }

    fn space(&self) -> &str {
        &self.space
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_image(&self, images: &[Vec<u8>]) -> Result<Vec<EmbeddingVector>, EmbedError> {
        if images.is_empty() {
            return Err(EmbedError::EmptyInput);
        }

        // Decode and stage through temp files; the files must outlive
        // the embed call.
        let mut staged = Vec::with_capacity(images.len());
        for bytes in images {
            let decoded = image::load_from_memory(bytes).map_err(|e| EmbedError::Provider {
                provider: PROVIDER.to_string(),
                message: format!("cannot decode image: {e}"),
            })?;
            let file = tempfile::Builder::new()
                .prefix("vogue-query-")
                .suffix(".png")
                .tempfile()
                .map_err(|e| EmbedError::Provider {
                    provider: PROVIDER.to_string(),
                    message: format!("cannot stage image: {e}"),
                })?;
            decoded
                .save_with_format(file.path(), ImageFormat::Png)
                .map_err(|e| EmbedError::Provider {
                    provider: PROVIDER.to_string(),
                    message: format!("cannot stage image: {e}"),
                })?;
            staged.push(file);
        }
        let paths: Vec<PathBuf> = staged.iter().map(|f| f.path().to_path_buf()).collect();

        let mut model = self.model.lock().map_err(|e| EmbedError::Provider {
            provider: PROVIDER.to_string(),
            message: format!("model lock poisoned: {e}"),
        })?;

        let raw = model.embed(paths, None).map_err(|e| EmbedError::Provider {
            provider: PROVIDER.to_string(),
            message: e.to_string(),
        })?;

        raw.into_iter()
            .map(|values| {
                if values.len() != self.dimensions {
                    return Err(EmbedError::DimensionMismatch {
                        provider: PROVIDER.to_string(),
                        expected: self.dimensions,
                        got: values.len(),
                    });
                }
                Ok(EmbeddingVector {
                    values,
                    provider: PROVIDER.to_string(),
                    space: self.space.clone(),
                })
            })
            .collect()
    }
}

fn parse_text_model(name: &str) -> Result<(fastembed::EmbeddingModel, String), EmbedError> {
    let canonical = name.to_lowercase();
    let model = match canonical.as_str() {
        "all-minilm-l6-v2" => fastembed::EmbeddingModel::AllMiniLML6V2,
        "bge-small-en-v1.5" => fastembed::EmbeddingModel::BGESmallENV15,
        "bge-base-en-v1.5" => fastembed::EmbeddingModel::BGEBaseENV15,
        "bge-large-en-v1.5" => fastembed::EmbeddingModel::BGELargeENV15,
        "clip-vit-b-32" => fastembed::EmbeddingModel::ClipVitB32,
        _ => {
            return Err(EmbedError::InvalidModel(format!(
                "unknown text model '{name}'; supported: all-MiniLM-L6-v2, bge-small-en-v1.5, \
                 bge-base-en-v1.5, bge-large-en-v1.5, clip-vit-b-32"
            )))
        }
    };
    let space = if canonical == CLIP_SPACE {
        CLIP_SPACE.to_string()
    } else {
        canonical
    };
    Ok((model, space))
}

fn parse_image_model(name: &str) -> Result<(ImageEmbeddingModel, String), EmbedError> {
    let canonical = name.to_lowercase();
    let model = match canonical.as_str() {
        "clip-vit-b-32" => ImageEmbeddingModel::ClipVitB32,
        "resnet50" => ImageEmbeddingModel::Resnet50,
        _ => {
            return Err(EmbedError::InvalidModel(format!(
                "unknown image model '{name}'; supported: clip-vit-b-32, resnet50"
            )))
        }
    };
    Ok((model, canonical))
}

fn probe_text_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbedError> {
    let probe = model
        .embed(vec!["probe"], None)
        .map_err(|e| EmbedError::InitFailed(format!("dimension probe failed: {e}")))?;
    probe
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbedError::InitFailed("model returned no embedding".to_string()))
}

fn probe_image_dimensions(model: &mut ImageEmbedding) -> Result<usize, EmbedError> {
    let file = tempfile::Builder::new()
        .prefix("vogue-probe-")
        .suffix(".png")
        .tempfile()
        .map_err(|e| EmbedError::InitFailed(format!("dimension probe failed: {e}")))?;
    image::RgbImage::new(8, 8)
        .save_with_format(file.path(), ImageFormat::Png)
        .map_err(|e| EmbedError::InitFailed(format!("dimension probe failed: {e}")))?;

    let probe = model
        .embed(vec![file.path().to_path_buf()], None)
        .map_err(|e| EmbedError::InitFailed(format!("dimension probe failed: {e}")))?;
    probe
        .first()
        .map(|v| v.len())
        .ok_or_else(|| EmbedError::InitFailed("model returned no embedding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_text_model_rejected() {
        let dir = std::env::temp_dir().join("vogue-embed-invalid");
        let result = LocalTextEmbedder::new("nonexistent-model", dir);
        assert!(matches!(result, Err(EmbedError::InvalidModel(_))));
    }

    #[test]
    fn test_invalid_image_model_rejected() {
        let dir = std::env::temp_dir().join("vogue-embed-invalid-img");
        let result = LocalImageEmbedder::new("nonexistent-model", dir);
        assert!(matches!(result, Err(EmbedError::InvalidModel(_))));
    }

    #[test]
    fn test_clip_pair_shares_space() {
        let (_, text_space) = parse_text_model("clip-vit-b-32").unwrap();
        let (_, image_space) = parse_image_model("clip-vit-b-32").unwrap();
        assert_eq!(text_space, image_space);
    }

    #[test]
    fn test_text_space_defaults_to_model_name() {
        let (_, space) = parse_text_model("BGE-Base-EN-v1.5").unwrap();
        assert_eq!(space, "bge-base-en-v1.5");
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_local_text_embedding() {
        let dir = std::env::temp_dir().join("vogue-embed-local-test");
        let embedder = LocalTextEmbedder::new("all-MiniLM-L6-v2", dir.clone()).unwrap();
        assert_eq!(embedder.dimensions(), 384);

        let vectors = embedder
            .embed_text(&["red jacket".to_string(), "blue shoes".to_string()])
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].dimension(), 384);
        assert_eq!(vectors[0].provider, PROVIDER);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
