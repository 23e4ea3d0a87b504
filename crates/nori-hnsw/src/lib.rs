//! HNSW (Hierarchical Navigable Small World) index for NoriKV.
//!
//! Provides approximate nearest neighbor (ANN) search over caller-assigned
//! `u64` ids using a layered proximity graph:
//!
//! - Higher layers have fewer nodes (exponential decay)
//! - Each layer is a navigable small-world graph
//! - Search starts at the entry point on the top layer and descends
//!
//! # Architecture
//!
//! ```text
//!            HnswIndex (add / delete / search)
//!               │
//!     ┌─────────┼───────────────┬──────────────┐
//!     ▼         ▼               ▼              ▼
//!  Graph    Distancer       Flat scan      KvStore buckets
//!  (sharded  (raw vectors    (allow-list    (vectors, codes,
//!   locks)    or PQ/SQ8)      < cutoff)      tombstones, graph)
//! ```
//!
//! Deletes are soft: ids are tombstoned, stay traversable, and are removed
//! from neighbor lists by [`HnswIndex::cleanup_tombstones`] (run periodically
//! by a [`CleanupCycle`]).
//!
//! # Parameters
//!
//! - `m`: Max connections per node on upper layers (default: 16)
//! - `m_max0`: Max connections on layer 0 (default: 32)
//! - `ef_construction`: Beam width during index building (default: 128)
//! - `ef_search`: Beam width during search (default: dynamic, `k * 8` in `[100, 500]`)
//! - `flat_search_cutoff`: Allow-lists smaller than this are scanned linearly
//!
//! # Example
//!
//! ```
//! use nori_hnsw::{HnswConfig, HnswIndex};
//! use nori_vector::{DistanceFunction, VectorIndex};
//!
//! let config = HnswConfig::new(2, DistanceFunction::Euclidean);
//! let index = HnswIndex::in_memory(config).unwrap();
//!
//! index.add(1, &[0.0, 0.0]).unwrap();
//! index.add(2, &[1.0, 0.0]).unwrap();
//! index.add(4, &[5.0, 5.0]).unwrap();
//!
//! let results = index.search_by_vector(&[0.0, 0.0], 2, None).unwrap();
//! assert_eq!(results[0].id, 1);
//! assert_eq!(results[1].id, 2);
//! ```

mod config;
mod cycle;
mod delete;
mod distancer;
mod flat;
mod graph;
mod index;
mod insert;
mod layer;
mod persist;
mod search;
mod store;

pub use config::{HnswConfig, SearchTuning, UpdatePolicy};
pub use cycle::CleanupCycle;
pub use index::HnswIndex;
pub use store::{Bucket, Cursor, KvStore, MemoryStore};

/// Error type for HNSW operations.
#[derive(Debug, thiserror::Error)]
pub enum HnswError {
    #[error("Vector error: {0}")]
    Vector(#[from] nori_vector::VectorError),

    #[error("Compression error: {0}")]
    Quant(#[from] nori_quant::QuantError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Operation cancelled before any mutation")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("{} batch item(s) failed", .0.len())]
    Batch(Vec<BatchItemError>),
}

/// Failure of a single item in [`HnswIndex::add_batch`](nori_vector::VectorIndex::add_batch).
#[derive(Debug, thiserror::Error)]
#[error("item {position} (id {id}): {source}")]
pub struct BatchItemError {
    /// Position of the item in the batch.
    pub position: usize,
    pub id: u64,
    pub source: Box<HnswError>,
}

/// Result type for HNSW operations.
pub type Result<T> = std::result::Result<T, HnswError>;
