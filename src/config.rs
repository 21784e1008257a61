use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::search::embeddings::DEFAULT_MODEL;
use crate::search::RankerConfig;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default number of results per query
const DEFAULT_TOP_K: usize = 16;
const DEFAULT_IMAGES_DIR: &str = "images";
const DEFAULT_VECTORS_FILE: &str = "vectors.bin";
const MODELS_DIR: &str = "models";

/// Configuration for the embedding model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Multimodal model name (e.g., "clip-vit-b-32")
    #[serde(default = "default_model")]
    pub model: String,

    /// Show a progress bar while the model downloads
    #[serde(default = "default_show_download_progress")]
    pub show_download_progress: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            show_download_progress: true,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_show_download_progress() -> bool {
    true
}

/// Configuration for queries
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Results per query when the caller does not ask for a count
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub ranker: RankerConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            ranker: RankerConfig::default(),
        }
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    /// Image directory, relative to the base path
    #[serde(default = "default_images_dir")]
    pub images_dir: String,
    /// Vector file, relative to the base path
    #[serde(default = "default_vectors_file")]
    pub vectors_file: String,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            search: SearchConfig::default(),
            images_dir: default_images_dir(),
            vectors_file: default_vectors_file(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_images_dir() -> String {
    DEFAULT_IMAGES_DIR.to_string()
}

fn default_vectors_file() -> String {
    DEFAULT_VECTORS_FILE.to_string()
}

impl Config {
    fn validate(&self) -> Result<()> {
        ensure!(
            !self.embedding.model.trim().is_empty(),
            "embedding.model must not be empty"
        );
        ensure!(self.search.top_k > 0, "search.top_k must be greater than 0");
        self.search
            .ranker
            .validate()
            .context("invalid search.ranker")?;
        ensure!(!self.images_dir.is_empty(), "images_dir must not be empty");
        ensure!(!self.vectors_file.is_empty(), "vectors_file must not be empty");
        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing defaults if it is missing.
    pub fn load_with(base_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join(CONFIG_FILE_NAME);

        // create new if does not exist
        if !config_path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&config_path, defaults)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        let config_path = self.base_path.join(CONFIG_FILE_NAME);
        std::fs::write(&config_path, config_str)
            .with_context(|| format!("failed to write {}", config_path.display()))
    }

    pub fn images_path(&self) -> PathBuf {
        self.base_path.join(&self.images_dir)
    }

    pub fn vectors_path(&self) -> PathBuf {
        self.base_path.join(&self.vectors_file)
    }

    pub fn models_path(&self) -> PathBuf {
        self.base_path.join(MODELS_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path()).unwrap();

        assert!(dir.path().join(CONFIG_FILE_NAME).is_file());
        assert_eq!(config.search.top_k, DEFAULT_TOP_K);
        assert_eq!(config.embedding.model, DEFAULT_MODEL);
        assert_eq!(config.search.ranker, RankerConfig::default());
        assert_eq!(config.images_path(), dir.path().join("images"));
        assert_eq!(config.vectors_path(), dir.path().join("vectors.bin"));
    }

    #[test]
    fn test_partial_config_is_upgraded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "search:\n  top_k: 4\n  ranker:\n    softmax_cutoff: 0.05\n").unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.search.top_k, 4);
        assert!((config.search.ranker.softmax_cutoff - 0.05).abs() < f32::EPSILON);
        assert!((config.search.ranker.softmax_scale - 100.0).abs() < f32::EPSILON);

        let resaved = std::fs::read_to_string(&path).unwrap();
        assert!(resaved.contains("softmax_scale"));
        assert!(resaved.contains("images_dir"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        std::fs::write(&path, "search:\n  top_k: 0\n").unwrap();
        assert!(Config::load_with(dir.path()).is_err());

        std::fs::write(&path, "search:\n  ranker:\n    text_overfetch: 0\n").unwrap();
        assert!(Config::load_with(dir.path()).is_err());

        std::fs::write(&path, "search: [not, a, map]\n").unwrap();
        assert!(Config::load_with(dir.path()).is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load_with(dir.path()).unwrap();
        config.search.top_k = 3;
        config.save().unwrap();

        let reloaded = Config::load_with(dir.path()).unwrap();
        assert_eq!(reloaded, config);
    }
}
