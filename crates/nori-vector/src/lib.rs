//! Vector primitives shared by the nori ANN index crates.
//!
//! - **Distance functions**: Euclidean (L2), Cosine, Inner Product
//! - **Candidate queues**: bounded min/max heaps of `(id, distance)`
//! - **Allow-lists**: query-scoped id filters
//! - **Linear scan**: exact top-k over an explicit id set
//! - **VectorIndex trait**: the contract every ANN backend implements
//!
//! # Example
//!
//! ```
//! use nori_vector::{scan, DistanceFunction};
//!
//! let vectors = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![5.0, 5.0]];
//! let query = [0.0, 0.0];
//!
//! let top = scan(0..vectors.len() as u64, 2, |id| {
//!     Ok::<_, nori_vector::VectorError>(Some(
//!         DistanceFunction::Euclidean.distance(&query, &vectors[id as usize]),
//!     ))
//! })
//! .unwrap();
//! assert_eq!(top[0].id, 0);
//! assert_eq!(top[1].id, 1);
//! ```

mod allow;
mod distance;
mod queue;
mod scan;
mod traits;

pub use allow::AllowList;
pub use distance::{
    cosine_distance, euclidean_distance, euclidean_distance_squared, inner_product, normalize,
    DistanceFunction,
};
pub use queue::{Item, Queue};
pub use scan::{scan, scan_into_queue};
pub use traits::{VectorIndex, VectorMatch};

/// Error type for vector operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    #[error("Index error: {0}")]
    IndexError(String),
}

/// Result type for vector operations.
pub type Result<T> = std::result::Result<T, VectorError>;

/// Validate a vector's dimensions and values.
///
/// Rejects wrong lengths with `DimensionMismatch` and NaN or infinite
/// components with `InvalidVector`.
pub fn validate_vector(dimensions: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != dimensions {
        return Err(VectorError::DimensionMismatch {
            expected: dimensions,
            actual: vector.len(),
        });
    }

    for (i, &v) in vector.iter().enumerate() {
        if v.is_nan() {
            return Err(VectorError::InvalidVector(format!("NaN at index {}", i)));
        }
        if v.is_infinite() {
            return Err(VectorError::InvalidVector(format!("Inf at index {}", i)));
        }
    }

    Ok(())
}
