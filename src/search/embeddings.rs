//! Embedding providers for images and text.
//!
//! Both modalities must land in one vector space, so a provider pairs an
//! image model with the text model trained alongside it:
//! - Lazy model download into a configurable cache directory
//! - Dimension probing on both sides at construction
//! - L2 normalization of every vector handed out

use std::path::PathBuf;
use std::sync::Mutex;

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding};

use crate::images::{Image, ImageError};

/// Default multimodal model
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),

    #[error("Query text is empty")]
    EmptyText,

    #[error("Model returned a zero-norm vector")]
    ZeroNorm,

    #[error("Image encoding failed: {0}")]
    Image(#[from] ImageError),
}

/// Maps images and text into one fixed-dimension, unit-norm vector space.
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, used to tag persisted vectors.
    fn model_id(&self) -> &str;

    /// Embedding dimensions, fixed for the lifetime of the provider.
    fn dimensions(&self) -> usize;

    fn embed_image(&self, image: &Image) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// SHA256 of the model identifier.
    fn model_id_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.model_id().as_bytes());
        hasher.finalize().into()
    }
}

/// Scale `v` to unit L2 norm.
pub fn l2_normalize(mut v: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON || !norm.is_finite() {
        return Err(EmbeddingError::ZeroNorm);
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Ok(v)
}

/// fastembed-backed provider pairing a vision model with its text tower.
///
/// Uses Mutexes because fastembed's embed() requires &mut self.
pub struct ClipEmbedder {
    image_model: Mutex<ImageEmbedding>,
    text_model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl ClipEmbedder {
    /// Load the image and text halves of `model_name`.
    ///
    /// Models are downloaded on first use and cached in `cache_dir`.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        show_download_progress: bool,
    ) -> Result<Self, EmbeddingError> {
        let (canonical, image_enum, text_enum) = Self::parse_model_name(model_name)?;

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
        })?;

        log::info!("Loading embedding model '{}'", canonical);

        let image_options = ImageInitOptions::new(image_enum)
            .with_cache_dir(cache_dir.clone())
            .with_show_download_progress(show_download_progress);
        let mut image_model = ImageEmbedding::try_new(image_options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let text_options = InitOptions::new(text_enum)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(show_download_progress);
        let mut text_model = TextEmbedding::try_new(text_options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut image_model, &mut text_model)?;
        log::debug!("Model '{}' produces {}-dim vectors", canonical, dimensions);

        Ok(Self {
            image_model: Mutex::new(image_model),
            text_model: Mutex::new(text_model),
            model_name: canonical.to_string(),
            dimensions,
        })
    }

    /// Parse a model name into its canonical id and the matching vision/text pair.
    ///
    /// The canonical id tags persisted vectors, so aliases share one index.
    fn parse_model_name(
        name: &str,
    ) -> Result<(&'static str, ImageEmbeddingModel, fastembed::EmbeddingModel), EmbeddingError> {
        match name.to_lowercase().as_str() {
            "clip-vit-b-32" | "clipvitb32" => Ok((
                DEFAULT_MODEL,
                ImageEmbeddingModel::ClipVitB32,
                fastembed::EmbeddingModel::ClipVitB32,
            )),
            "nomic-embed-v1.5" | "nomicembedv15" => Ok((
                "nomic-embed-v1.5",
                ImageEmbeddingModel::NomicEmbedVisionV15,
                fastembed::EmbeddingModel::NomicEmbedTextV15,
            )),
            _ => Err(EmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: clip-vit-b-32, nomic-embed-v1.5",
                name
            ))),
        }
    }

    /// Probe both towers and make sure they agree on dimensions.
    fn probe_dimensions(
        image_model: &mut ImageEmbedding,
        text_model: &mut TextEmbedding,
    ) -> Result<usize, EmbeddingError> {
        let text_dims = text_model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe text model: {}", e)))?
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Text model returned no embedding".to_string()))?;

        let probe = Image::from_shape(&[8, 8, 3], vec![127; 8 * 8 * 3])?.encode_png()?;
        let image_dims = image_model
            .embed_bytes(&[probe.as_slice()], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe image model: {}", e)))?
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Image model returned no embedding".to_string()))?;

        if text_dims != image_dims {
            return Err(EmbeddingError::InitFailed(format!(
                "Image and text towers disagree on dimensions: {} vs {}",
                image_dims, text_dims
            )));
        }

        Ok(text_dims)
    }
}

impl EmbeddingProvider for ClipEmbedder {
    fn model_id(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_image(&self, image: &Image) -> Result<Vec<f32>, EmbeddingError> {
        let png = image.encode_png()?;

        let mut model = self.image_model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embedding = model
            .embed_bytes(&[png.as_slice()], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))?;

        l2_normalize(embedding)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbeddingError::EmptyText);
        }

        let mut model = self.text_model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        let embedding = model
            .embed(vec![text], None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))?;

        l2_normalize(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_model_name() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = ClipEmbedder::new("nonexistent-model", temp_dir.path().to_path_buf(), false);
        assert!(matches!(result, Err(EmbeddingError::InvalidModel(_))));
    }

    #[test]
    fn test_model_aliases_share_canonical_id() {
        assert_eq!(ClipEmbedder::parse_model_name("CLIP-ViT-B-32").unwrap().0, DEFAULT_MODEL);
        assert_eq!(ClipEmbedder::parse_model_name("ClipVitB32").unwrap().0, DEFAULT_MODEL);
        assert_eq!(ClipEmbedder::parse_model_name("nomicembedv15").unwrap().0, "nomic-embed-v1.5");
        assert!(ClipEmbedder::parse_model_name("bge-base-en-v1.5").is_err());
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        assert!(matches!(l2_normalize(vec![0.0, 0.0]), Err(EmbeddingError::ZeroNorm)));
    }

    // Integration tests require model download - run with --ignored
    #[test]
    #[ignore = "requires model download"]
    fn test_clip_shares_space_across_modalities() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = ClipEmbedder::new(DEFAULT_MODEL, temp_dir.path().to_path_buf(), false).unwrap();
        assert_eq!(model.dimensions(), 512);

        let red = Image::from_rgb(image::RgbImage::from_pixel(64, 64, image::Rgb([220, 20, 20]))).unwrap();
        let image_vec = model.embed_image(&red).unwrap();
        let text_vec = model.embed_text("a plain red square").unwrap();

        assert_eq!(image_vec.len(), text_vec.len());
        let norm: f32 = image_vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_empty_text_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let model = ClipEmbedder::new(DEFAULT_MODEL, temp_dir.path().to_path_buf(), false).unwrap();
        assert!(matches!(model.embed_text("   "), Err(EmbeddingError::EmptyText)));
    }
}
