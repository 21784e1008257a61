//! Search engine coordinating the embedding provider, the vector index and
//! the image store.
//!
//! The index and the image store must always hold the same ids. Both live
//! behind a single `RwLock`: inserts and deletes hold the write half for
//! their whole two-step protocol, searches share the read half. A reader
//! therefore never sees an id present in one store but not the other.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::images::{Image, ImageError};
use crate::search::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::search::index::{IndexError, VectorIndex};
use crate::search::ranker::{RankerConfig, SearchRanker};
use crate::storage::{ImageStore, ImageStoreError};

/// Errors that can occur during engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{op}: entry {id} not found")]
    NotFound { id: u64, op: &'static str },

    #[error("Consistency error during {op} of entry {id}: {detail}")]
    Consistency {
        id: u64,
        op: &'static str,
        detail: String,
    },

    #[error("Inconsistent stores: {0}")]
    Mismatch(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Image store error: {0}")]
    ImageStore(#[from] ImageStoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ImageError> for EngineError {
    fn from(e: ImageError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl EngineError {
    /// Whether the two-store invariant is known to be broken.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            EngineError::Consistency { .. } | EngineError::Mismatch(_)
        )
    }

    /// Whether a collaborator (model, index, image store) failed.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            EngineError::Embedding(_) | EngineError::Index(_) | EngineError::ImageStore(_)
        )
    }
}

struct Stores {
    index: Box<dyn VectorIndex>,
    images: Box<dyn ImageStore>,
}

impl Stores {
    /// Compare both id sets; report the first orphan found.
    fn verify(&self) -> Result<(), EngineError> {
        let index_size = self.index.size();
        let image_size = self.images.size();
        if index_size != image_size {
            return Err(EngineError::Mismatch(format!(
                "vector index holds {} entries, image store holds {}",
                index_size, image_size
            )));
        }

        if let Some(id) = self.index.ids().into_iter().find(|id| !self.images.has(*id)) {
            return Err(EngineError::Mismatch(format!(
                "vector {} has no image",
                id
            )));
        }

        if let Some(id) = self.images.ids().into_iter().find(|id| !self.index.contains(*id)) {
            return Err(EngineError::Mismatch(format!(
                "image {} has no vector",
                id
            )));
        }

        Ok(())
    }
}

/// Multimodal search over a synchronized vector index and image store.
pub struct SearchEngine {
    provider: Box<dyn EmbeddingProvider>,
    ranker: SearchRanker,
    stores: RwLock<Stores>,
}

impl SearchEngine {
    /// Wire up the engine and verify both stores agree.
    ///
    /// Fails fast on any mismatch; there is no automatic reconciliation.
    pub fn new(
        provider: Box<dyn EmbeddingProvider>,
        index: Box<dyn VectorIndex>,
        images: Box<dyn ImageStore>,
        ranker_config: RankerConfig,
    ) -> Result<Self, EngineError> {
        if provider.dimensions() != index.dimensions() {
            return Err(IndexError::DimensionMismatch {
                expected: index.dimensions(),
                got: provider.dimensions(),
            }
            .into());
        }

        let stores = Stores { index, images };
        stores.verify()?;

        log::info!(
            "Search engine ready: {} entries, model '{}'",
            stores.index.size(),
            provider.model_id()
        );

        Ok(Self {
            provider,
            ranker: SearchRanker::new(ranker_config),
            stores: RwLock::new(stores),
        })
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    /// Number of entries.
    pub fn size(&self) -> Result<usize, EngineError> {
        Ok(self.read()?.index.size())
    }

    /// Re-run the startup consistency check.
    pub fn check_consistency(&self) -> Result<(), EngineError> {
        self.read()?.verify()
    }

    /// Validate a raw `(height, width, 3)` buffer and insert it.
    pub fn insert_image_raw(&self, shape: &[usize], data: Vec<u8>) -> Result<u64, EngineError> {
        let image = Image::from_shape(shape, data)?;
        self.insert_image(&image)
    }

    /// Embed and store an image, returning its new id.
    pub fn insert_image(&self, image: &Image) -> Result<u64, EngineError> {
        let ids = self.insert_images(std::slice::from_ref(image))?;
        ids.first()
            .copied()
            .ok_or_else(|| EngineError::Internal("index assigned no id".to_string()))
    }

    /// Embed and store several images, returning their ids in input order.
    ///
    /// Ids come from the vector index, which persists the whole batch in
    /// one write; the image store then receives each image under its id.
    /// If the image store fails, the vectors from the failing image on are
    /// rolled back, the images before it stay stored, and the result is a
    /// consistency error.
    pub fn insert_images(&self, images: &[Image]) -> Result<Vec<u64>, EngineError> {
        if images.is_empty() {
            return Ok(vec![]);
        }

        let embeddings = images
            .iter()
            .map(|image| self.provider.embed_image(image))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stores = self.write()?;
        let ids = stores.index.insert_batch(embeddings)?;

        for (pos, (image, &id)) in images.iter().zip(&ids).enumerate() {
            if let Err(e) = stores.images.insert(image, id) {
                log::error!("Image store rejected entry {}: {}", id, e);
                let pending = &ids[pos..];
                let detail = match stores.index.delete_batch(pending) {
                    Ok(()) => format!(
                        "image store failed ({e}); {} vector(s) rolled back, {} entries kept",
                        pending.len(),
                        pos
                    ),
                    Err(rollback) => {
                        format!("image store failed ({e}); vector rollback failed ({rollback})")
                    }
                };
                return Err(EngineError::Consistency {
                    id,
                    op: "insert",
                    detail,
                });
            }
        }

        log::debug!("Inserted {} entries, count = {}", ids.len(), stores.index.size());
        Ok(ids)
    }

    /// Remove an entry from both stores.
    pub fn delete_image(&self, id: u64) -> Result<(), EngineError> {
        let mut stores = self.write()?;

        if !stores.index.contains(id) || !stores.images.has(id) {
            return Err(EngineError::NotFound { id, op: "delete" });
        }

        stores.index.delete(id)?;

        if let Err(e) = stores.images.delete(id) {
            log::error!("Vector {} deleted but image removal failed: {}", id, e);
            return Err(EngineError::Consistency {
                id,
                op: "delete",
                detail: format!("vector removed, image removal failed ({e})"),
            });
        }

        log::debug!("Deleted entry {}, count = {}", id, stores.index.size());
        Ok(())
    }

    pub fn get_image(&self, id: u64) -> Result<Image, EngineError> {
        let stores = self.read()?;
        if !stores.images.has(id) {
            return Err(EngineError::NotFound { id, op: "get" });
        }
        Ok(stores.images.get(id)?)
    }

    pub fn get_image_uri(&self, id: u64) -> Result<String, EngineError> {
        let stores = self.read()?;
        if !stores.images.has(id) {
            return Err(EngineError::NotFound { id, op: "get_uri" });
        }
        Ok(stores.images.get_uri(id))
    }

    /// `(id, uri)` for every entry, ascending by id.
    pub fn entries(&self) -> Result<Vec<(u64, String)>, EngineError> {
        let stores = self.read()?;
        Ok(stores.images.ids().into_iter().zip(stores.images.uris()).collect())
    }

    /// Id of the entry whose image is stored at `uri`.
    pub fn id_for_uri(&self, uri: &str) -> Result<u64, EngineError> {
        let stores = self.read()?;
        let id = stores
            .images
            .get_id(uri)
            .map_err(|e| EngineError::Validation(e.to_string()))?;
        if !stores.index.contains(id) || !stores.images.has(id) {
            return Err(EngineError::NotFound { id, op: "lookup" });
        }
        Ok(id)
    }

    /// Map ranked ids to image uris, keeping the order.
    pub fn resolve_uris(&self, ids: &[u64]) -> Result<Vec<String>, EngineError> {
        let stores = self.read()?;
        ids.iter()
            .map(|&id| {
                if stores.images.has(id) {
                    Ok(stores.images.get_uri(id))
                } else {
                    Err(EngineError::NotFound { id, op: "resolve_uri" })
                }
            })
            .collect()
    }

    /// Search with an image using the configured similarity threshold.
    pub fn search_with_image(&self, image: &Image, top_k: usize) -> Result<Vec<u64>, EngineError> {
        let threshold = self.ranker.config().image_threshold;
        self.search_with_image_threshold(image, top_k, threshold)
    }

    /// Search with an image, keeping matches with `similarity >= threshold`.
    pub fn search_with_image_threshold(
        &self,
        image: &Image,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<u64>, EngineError> {
        if !(-1.0..=1.0).contains(&threshold) {
            return Err(EngineError::Validation(format!(
                "threshold must be between -1.0 and 1.0, got {}",
                threshold
            )));
        }

        let query = self.provider.embed_image(image)?;

        let stores = self.read()?;
        let candidates = stores.index.search(&query, top_k, threshold)?;
        let ranked = self.ranker.rank_by_image(&candidates, top_k, threshold);

        log::debug!("Image search: {} candidates, {} kept", candidates.len(), ranked.len());
        Ok(ranked)
    }

    /// Search with text using the softmax cutoff policy.
    pub fn search_with_text(&self, text: &str, top_k: usize) -> Result<Vec<u64>, EngineError> {
        if text.trim().is_empty() {
            return Err(EngineError::Validation("query text is empty".to_string()));
        }

        let query = self.provider.embed_text(text)?;

        let stores = self.read()?;
        let fetch = self.ranker.text_fetch_size(top_k);
        let candidates = stores
            .index
            .search(&query, fetch, self.ranker.config().text_floor)?;
        let ranked = self.ranker.rank_by_text(&candidates, top_k);

        log::debug!("Text search: {} candidates, {} kept", candidates.len(), ranked.len());
        Ok(ranked)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Stores>, EngineError> {
        self.stores
            .read()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Stores>, EngineError> {
        self.stores
            .write()
            .map_err(|e| EngineError::Internal(format!("Lock poisoned: {}", e)))
    }
}
