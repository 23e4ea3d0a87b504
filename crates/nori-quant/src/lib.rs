//! Vector compression for the nori ANN indexes.
//!
//! Two codecs are available:
//!
//! - [`ProductQuantizer`]: splits vectors into subspaces and stores one
//!   centroid id per subspace (32x+ compression)
//! - [`ScalarQuantizer`]: one byte per dimension, min/max calibrated (4x)
//!
//! A [`Compressor`] owns a trained codebook plus the code store for every
//! indexed id, and hands out per-query [`CompressorDistancer`]s that score
//! codes against a precomputed lookup table.
//!
//! # Example
//!
//! ```
//! use nori_quant::{CompressionConfig, Compressor, SQConfig};
//! use nori_vector::DistanceFunction;
//!
//! let training: Vec<Vec<f32>> = (0..64).map(|i| vec![i as f32, 1.0, -(i as f32)]).collect();
//! let config = CompressionConfig::Scalar(SQConfig::default());
//! let compressor = Compressor::train(&config, DistanceFunction::Euclidean, &training, 3).unwrap();
//!
//! for (id, v) in training.iter().enumerate() {
//!     compressor.insert(id as u64, v).unwrap();
//! }
//!
//! let distancer = compressor.new_distancer(&[10.0, 1.0, -10.0]).unwrap();
//! assert!(distancer.distance_to(10).unwrap() < distancer.distance_to(60).unwrap());
//! ```

mod compressor;
mod pq;
mod sq;

pub use compressor::{Codebook, Compressor, CompressorDistancer};
pub use pq::{PQConfig, ProductQuantizer};
pub use sq::{SQConfig, ScalarQuantizer};

use serde::{Deserialize, Serialize};

/// The inner kernel a lookup table is built for.
///
/// Every metric reduces to one of these: Euclidean sums squared differences,
/// cosine (over normalized vectors) and inner product sum products.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    L2,
    Dot,
}

/// Which codec, if any, an index compresses with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompressionConfig {
    #[default]
    None,
    Product(PQConfig),
    Scalar(SQConfig),
}

impl CompressionConfig {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CompressionConfig::None)
    }

    /// Number of indexed vectors that triggers automatic training.
    pub fn training_limit(&self) -> Option<usize> {
        match self {
            CompressionConfig::None => None,
            CompressionConfig::Product(pq) => Some(pq.training_limit),
            CompressionConfig::Scalar(sq) => Some(sq.training_limit),
        }
    }

    pub fn validate(&self, dimensions: usize) -> Result<()> {
        match self {
            CompressionConfig::Product(pq) => pq.validate(dimensions),
            CompressionConfig::Scalar(sq) if sq.training_limit == 0 => {
                Err(QuantError::Training("training_limit must be > 0".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Error type for quantization.
#[derive(Debug, thiserror::Error)]
pub enum QuantError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Compressor not trained")]
    NotTrained,

    #[error("Training failed: {0}")]
    Training(String),

    #[error("No compressed code for id {0}")]
    MissingCode(u64),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, QuantError>;
