//! Multimodal similarity search.
//!
//! Images and text are embedded into one vector space; images are stored
//! next to their vectors and retrieved by nearest-neighbor search.
//!
//! # Architecture
//!
//! - `embeddings`: Embedding provider trait and the fastembed CLIP backend
//! - `index`: Vector index trait and the exact cosine `FlatIndex`
//! - `storage`: Binary file I/O for vectors.bin persistence
//! - `ranker`: Image (absolute threshold) and text (softmax cutoff) ranking
//! - `engine`: Keeps index and image store in sync and runs queries

pub mod embeddings;
pub mod engine;
pub mod index;
mod ranker;
mod storage;

pub use embeddings::{ClipEmbedder, EmbeddingProvider};
pub use engine::SearchEngine;
pub use index::FlatIndex;
pub use ranker::RankerConfig;
pub use storage::VectorStorage;
