//! Vector index with auto-assigned ids and cosine similarity search.
//!
//! The index is the single source of entry ids: callers hand it a vector
//! and get back the id everything else is keyed by.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::search::storage::{VectorStorage, VectorStorageError};

/// First id handed out by an empty index.
pub const FIRST_ID: u64 = 1;

/// A raw nearest-neighbor hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: u64,
    /// Cosine similarity, higher is better
    pub similarity: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("Vector {0} not found")]
    NotFound(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),
}

/// Persistent id -> vector store with nearest-neighbor search.
pub trait VectorIndex: Send + Sync {
    fn dimensions(&self) -> usize;

    fn size(&self) -> usize;

    fn contains(&self, id: u64) -> bool;

    /// All ids, ascending.
    fn ids(&self) -> Vec<u64>;

    /// Store `embedding` under a fresh id and return that id.
    fn insert(&mut self, embedding: Vec<f32>) -> Result<u64, IndexError>;

    fn delete(&mut self, id: u64) -> Result<(), IndexError>;

    /// Store several embeddings under consecutive fresh ids, persisting once.
    ///
    /// All-or-nothing: one rejected vector leaves the index untouched.
    fn insert_batch(&mut self, embeddings: Vec<Vec<f32>>) -> Result<Vec<u64>, IndexError>;

    /// Remove several ids, persisting once. Fails without side effects if
    /// any id is absent.
    fn delete_batch(&mut self, ids: &[u64]) -> Result<(), IndexError>;

    /// Up to `k` candidates with `similarity >= threshold`, best first.
    fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<Candidate>, IndexError>;
}

/// Exact-search index held in memory and mirrored to a `vectors.bin` file.
///
/// Every mutation is persisted before it returns. Ids come from a
/// monotonic counter that is persisted too, so an id is never handed out
/// twice for the same file.
pub struct FlatIndex {
    entries: HashMap<u64, Vec<f32>>,
    dimensions: usize,
    next_id: u64,
    persistence: Option<(VectorStorage, [u8; 32])>,
}

impl FlatIndex {
    /// Create a new empty in-memory index with specified dimensions.
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
            next_id: FIRST_ID,
            persistence: None,
        }
    }

    /// Open the index backed by `storage`, creating the file if needed.
    ///
    /// `model_id` tags the file so vectors from different models are never
    /// mixed.
    pub fn open(
        storage: VectorStorage,
        model_id: [u8; 32],
        dimensions: usize,
    ) -> Result<Self, IndexError> {
        let mut index = if storage.exists() {
            let index = storage.load(&model_id, dimensions)?;
            log::info!(
                "Loaded {} vectors from {}",
                index.len(),
                storage.path().display()
            );
            index
        } else {
            log::info!("No existing index at {}, starting fresh", storage.path().display());
            let index = Self::new(dimensions);
            storage.save(&index, &model_id)?;
            index
        };

        index.persistence = Some((storage, model_id));
        Ok(index)
    }

    /// Rebuild an index from persisted parts.
    pub(crate) fn from_parts(
        dimensions: usize,
        next_id: u64,
        entries: Vec<(u64, Vec<f32>)>,
    ) -> Result<Self, IndexError> {
        let mut index = Self::with_capacity(dimensions, entries.len());
        for (id, embedding) in entries {
            index.check_vector(&embedding)?;
            index.entries.insert(id, embedding);
        }

        let max_id = index.entries.keys().copied().max().unwrap_or(0);
        index.next_id = next_id.max(max_id + 1).max(FIRST_ID);
        Ok(index)
    }

    fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
            next_id: FIRST_ID,
            persistence: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The id the next insert will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &[f32])> {
        self.entries.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    fn check_vector(&self, v: &[f32]) -> Result<(), IndexError> {
        if v.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: v.len(),
            });
        }
        if Self::l2_norm(v) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), IndexError> {
        if let Some((storage, model_id)) = &self.persistence {
            storage.save(self, model_id)?;
        }
        Ok(())
    }

    /// Compute L2 norm of a vector.
    fn l2_norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Compute cosine similarity between two vectors.
    /// Assumes query_norm is precomputed for efficiency.
    fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
        let target_norm = Self::l2_norm(target);
        if target_norm < f32::EPSILON {
            return 0.0;
        }

        let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
        dot_product / (query_norm * target_norm)
    }
}

impl VectorIndex for FlatIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn size(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn insert(&mut self, embedding: Vec<f32>) -> Result<u64, IndexError> {
        let ids = self.insert_batch(vec![embedding])?;
        Ok(ids[0])
    }

    fn delete(&mut self, id: u64) -> Result<(), IndexError> {
        self.delete_batch(&[id])
    }

    fn insert_batch(&mut self, embeddings: Vec<Vec<f32>>) -> Result<Vec<u64>, IndexError> {
        for embedding in &embeddings {
            self.check_vector(embedding)?;
        }

        let first = self.next_id;
        let ids: Vec<u64> = (first..first + embeddings.len() as u64).collect();
        for (id, embedding) in ids.iter().zip(embeddings) {
            self.entries.insert(*id, embedding);
        }
        self.next_id = first + ids.len() as u64;

        if let Err(e) = self.persist() {
            for id in &ids {
                self.entries.remove(id);
            }
            self.next_id = first;
            return Err(e);
        }

        log::trace!("Inserted {} vectors, count = {}", ids.len(), self.entries.len());
        Ok(ids)
    }

    fn delete_batch(&mut self, ids: &[u64]) -> Result<(), IndexError> {
        if let Some(missing) = ids.iter().find(|id| !self.entries.contains_key(id)) {
            return Err(IndexError::NotFound(*missing));
        }

        let removed: Vec<(u64, Vec<f32>)> = ids
            .iter()
            .filter_map(|id| self.entries.remove(id).map(|v| (*id, v)))
            .collect();

        if let Err(e) = self.persist() {
            self.entries.extend(removed);
            return Err(e);
        }

        log::trace!("Deleted {} vectors, count = {}", ids.len(), self.entries.len());
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize, threshold: f32) -> Result<Vec<Candidate>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = Self::l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        if k == 0 {
            return Ok(vec![]);
        }

        let mut results: Vec<Candidate> = self
            .entries
            .iter()
            .filter_map(|(id, embedding)| {
                let similarity = Self::cosine_similarity(query, embedding, query_norm);
                (similarity >= threshold).then_some(Candidate { id: *id, similarity })
            })
            .collect();

        // Best first; equal scores fall back to insertion order
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        results.truncate(k);

        Ok(results)
    }
}
