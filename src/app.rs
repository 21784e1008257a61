use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use homedir::my_home;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::Config;
use crate::images::{self, Image};
use crate::search::{ClipEmbedder, EmbeddingProvider, FlatIndex, SearchEngine, VectorStorage};
use crate::storage::LocalImageStore;

/// Files decoded in parallel and inserted as one batch
const IMPORT_CHUNK_SIZE: usize = 32;

/// Resolved application directories
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_path: PathBuf,
}

impl AppPaths {
    /// `MMSEARCH_BASE_PATH`, or `~/.local/share/mmsearch`.
    pub fn resolve() -> Result<Self> {
        let base_path = match std::env::var("MMSEARCH_BASE_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => {
                let home = my_home()
                    .map_err(|e| anyhow!("Could not determine home directory: {e:?}"))?
                    .ok_or_else(|| anyhow!("Home directory path is empty"))?;
                home.join(".local/share/mmsearch")
            }
        };

        std::fs::create_dir_all(&base_path)
            .context("Failed to create application base directory")?;

        Ok(Self { base_path })
    }
}

/// Build the engine from its configured collaborators.
///
/// Loading fails if the stores on disk disagree with each other.
pub fn open_engine(config: &Config) -> Result<SearchEngine> {
    let provider = ClipEmbedder::new(
        &config.embedding.model,
        config.models_path(),
        config.embedding.show_download_progress,
    )
    .context("Failed to load embedding model")?;

    let index = FlatIndex::open(
        VectorStorage::new(config.vectors_path()),
        provider.model_id_hash(),
        provider.dimensions(),
    )
    .context("Failed to open vector index")?;

    let images = LocalImageStore::new(&config.images_path()).context("Failed to open image store")?;

    let engine = SearchEngine::new(
        Box::new(provider),
        Box::new(index),
        Box::new(images),
        config.search.ranker.clone(),
    )?;

    Ok(engine)
}

/// Outcome of a directory import
#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    /// Ids of the new entries, in file name order
    pub inserted: Vec<u64>,
    /// Files that could not be decoded
    pub skipped: Vec<PathBuf>,
}

/// Image files directly inside `dir`, sorted by name.
pub fn scan_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| images::is_image_file(path))
        .collect();
    paths.sort();
    Ok(paths)
}

/// Insert every decodable image in `dir`.
///
/// Each chunk of files is decoded in parallel, then inserted as one batch
/// so the vector file is written once per chunk. Engine errors stop the
/// import; files that fail to decode are skipped.
pub fn import_dir(engine: &SearchEngine, dir: &Path, progress: &ProgressBar) -> Result<ImportReport> {
    let _span = tracing::info_span!("import", dir = %dir.display()).entered();

    let paths = scan_dir(dir)?;
    progress.set_length(paths.len() as u64);

    let mut report = ImportReport::default();

    for chunk in paths.chunks(IMPORT_CHUNK_SIZE) {
        let decoded: Vec<(&PathBuf, Result<Image, images::ImageError>)> = chunk
            .par_iter()
            .map(|path| (path, images::load_image(path)))
            .collect();

        let mut batch_paths = Vec::with_capacity(decoded.len());
        let mut batch = Vec::with_capacity(decoded.len());
        for (path, image) in decoded {
            match image {
                Ok(image) => {
                    batch_paths.push(path);
                    batch.push(image);
                }
                Err(e) => {
                    log::warn!("Skipping {}: {}", path.display(), e);
                    report.skipped.push(path.clone());
                }
            }
        }

        let ids = engine.insert_images(&batch).with_context(|| {
            format!(
                "Failed to insert batch starting at {}",
                batch_paths.first().map_or(dir, |p| p.as_path()).display()
            )
        })?;
        for (path, id) in batch_paths.iter().zip(&ids) {
            log::debug!("{} -> {}", path.display(), id);
        }
        report.inserted.extend(ids);
        progress.inc(chunk.len() as u64);
    }

    progress.finish_and_clear();
    Ok(report)
}

pub fn import_progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} {msg} [{elapsed_precise}]") {
        bar.set_style(style);
    }
    bar
}
