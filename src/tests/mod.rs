//! Cross-module tests.
//!
//! A hash-based fake embedding provider replaces the model so engine tests
//! run without downloads. Tests against the real model live next to the
//! provider and are marked #[ignore].


use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::images::Image;
use crate::search::embeddings::{l2_normalize, EmbeddingError, EmbeddingProvider};
use crate::search::engine::EngineError;
use crate::search::index::{Candidate, IndexError, VectorIndex};
use crate::search::{FlatIndex, RankerConfig, SearchEngine, VectorStorage};
use crate::storage::{ImageStore, ImageStoreError, LocalImageStore};

pub const TEST_DIMENSIONS: usize = 128;

/// Deterministic provider: identical input gives identical unit vectors,
/// distinct inputs give near-orthogonal ones.
pub struct FakeEmbedder {
    dimensions: usize,
    aliases: HashMap<String, Vec<f32>>,
}

impl FakeEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            aliases: HashMap::new(),
        }
    }

    /// Make `text` embed exactly like `image`.
    pub fn alias(mut self, text: &str, image: &Image) -> Self {
        let vector = self.vector_for(b"image", image.as_bytes());
        self.aliases.insert(text.to_string(), vector);
        self
    }

    fn vector_for(&self, domain: &[u8], bytes: &[u8]) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimensions);
        let mut block: u64 = 0;
        while values.len() < self.dimensions {
            let digest = Sha256::new()
                .chain_update(domain)
                .chain_update(bytes)
                .chain_update(block.to_le_bytes())
                .finalize();
            for chunk in digest.chunks_exact(4) {
                let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                values.push(raw as f32 / u32::MAX as f32 * 2.0 - 1.0);
            }
            block += 1;
        }
        values.truncate(self.dimensions);
        l2_normalize(values).expect("hash vectors are never zero")
    }
}

impl EmbeddingProvider for FakeEmbedder {
    fn model_id(&self) -> &str {
        "fake-hash-embedder"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_image(&self, image: &Image) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.vector_for(b"image", image.as_bytes()))
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        Ok(self
            .aliases
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.vector_for(b"text", text.as_bytes())))
    }
}

/// Image store whose writes can be made to fail on demand.
pub struct FlakyImageStore {
    inner: LocalImageStore,
    pub fail_insert: Arc<AtomicBool>,
    pub fail_delete: Arc<AtomicBool>,
}

impl FlakyImageStore {
    pub fn new(inner: LocalImageStore) -> Self {
        Self {
            inner,
            fail_insert: Arc::new(AtomicBool::new(false)),
            fail_delete: Arc::new(AtomicBool::new(false)),
        }
    }

    fn injected() -> ImageStoreError {
        ImageStoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
    }
}

impl ImageStore for FlakyImageStore {
    fn insert(&mut self, image: &Image, id: u64) -> Result<String, ImageStoreError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.insert(image, id)
    }

    fn get(&self, id: u64) -> Result<Image, ImageStoreError> {
        self.inner.get(id)
    }

    fn get_uri(&self, id: u64) -> String {
        self.inner.get_uri(id)
    }

    fn get_id(&self, uri: &str) -> Result<u64, ImageStoreError> {
        self.inner.get_id(uri)
    }

    fn has(&self, id: u64) -> bool {
        self.inner.has(id)
    }

    fn delete(&mut self, id: u64) -> Result<(), ImageStoreError> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.delete(id)
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn ids(&self) -> Vec<u64> {
        self.inner.ids()
    }
}

/// Index wrapper counting the mutations that reach the inner index.
///
/// Each counted call is one write of the vector file for a `FlatIndex`.
pub struct CountingIndex {
    inner: FlatIndex,
    pub writes: Arc<AtomicUsize>,
}

impl CountingIndex {
    pub fn new(inner: FlatIndex) -> Self {
        Self {
            inner,
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn count(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl VectorIndex for CountingIndex {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn contains(&self, id: u64) -> bool {
        self.inner.contains(id)
    }

    fn ids(&self) -> Vec<u64> {
        self.inner.ids()
    }

    fn insert(&mut self, embedding: Vec<f32>) -> Result<u64, IndexError> {
        self.count();
        self.inner.insert(embedding)
    }

    fn delete(&mut self, id: u64) -> Result<(), IndexError> {
        self.count();
        self.inner.delete(id)
    }

    fn insert_batch(&mut self, embeddings: Vec<Vec<f32>>) -> Result<Vec<u64>, IndexError> {
        self.count();
        self.inner.insert_batch(embeddings)
    }

    fn delete_batch(&mut self, ids: &[u64]) -> Result<(), IndexError> {
        self.count();
        self.inner.delete_batch(ids)
    }

    fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<Candidate>, IndexError> {
        self.inner.search(query, k, threshold)
    }
}

/// A 16x16 image whose pixels depend on `seed`.
pub fn pattern_image(seed: u8) -> Image {
    let data = (0..16 * 16 * 3)
        .map(|i: usize| (i as u8).wrapping_mul(31).wrapping_add(seed.wrapping_mul(17)))
        .collect();
    Image::from_shape(&[16, 16, 3], data).unwrap()
}

pub fn open_index(dir: &Path, provider: &FakeEmbedder) -> FlatIndex {
    FlatIndex::open(
        VectorStorage::new(dir.join("vectors.bin")),
        provider.model_id_hash(),
        provider.dimensions(),
    )
    .unwrap()
}

pub fn open_images(dir: &Path) -> LocalImageStore {
    LocalImageStore::new(&dir.join("images")).unwrap()
}

pub fn entry_ids(engine: &SearchEngine) -> Vec<u64> {
    engine.entries().unwrap().into_iter().map(|(id, _)| id).collect()
}

/// Engine over `dir` with the default ranker.
pub fn open_engine(dir: &Path, provider: FakeEmbedder) -> Result<SearchEngine, EngineError> {
    let index = open_index(dir, &provider);
    let images = open_images(dir);
    SearchEngine::new(
        Box::new(provider),
        Box::new(index),
        Box::new(images),
        RankerConfig::default(),
    )
}
