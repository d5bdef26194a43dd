//! Embedding-based similarity over semantic types.
//!
//! # Architecture
//!
//! - `embeddings`: the `Embedder` contract, fastembed client, cosine similarity
//! - `text`: templates turning definitions and queries into embedding input
//! - `vectors`: one `VectorRecord` per type, durable or in-memory
//! - `search`: thresholded, deduplicated, ranked lookups
//! - `indexer`: bulk and incremental maintenance of the vector store

pub mod embeddings;
pub mod indexer;
pub mod search;
pub mod text;
pub mod vectors;

pub use embeddings::{Embedder, LazyEmbedder};
pub use indexer::{DefinitionSource, IndexManager, IndexOptions, IndexState, Progress};
pub use search::{SimilaritySearch, DISAMBIGUATION_K, TOP_K};
pub use text::SimilarityQuery;
pub use vectors::VectorStore;

/// Default embedding model.
pub const DEFAULT_MODEL: &str = "bge-small-en-v1.5";

/// Default similarity threshold for lookups.
pub const DEFAULT_THRESHOLD: f32 = 0.35;
