//! Distance functions for vector similarity.
//!
//! Provides three common distance/similarity metrics:
//! - **Euclidean (L2)**: Traditional distance, good for general use
//! - **Cosine**: Angle-based similarity, good for normalized embeddings
//! - **Inner Product**: Dot product, good for maximum inner product search (MIPS)
//!
//! All functions are designed to be auto-vectorized by the compiler when using
//! release builds with appropriate target features.

use crate::{Result, VectorError};
use serde::{Deserialize, Serialize};

/// Distance function enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFunction {
    /// Euclidean (L2) distance: sqrt(sum((a[i] - b[i])^2))
    #[serde(alias = "l2")]
    Euclidean,
    /// Cosine distance: 1 - (a · b) / (||a|| * ||b||)
    Cosine,
    /// Inner product (negative for distance): -(a · b)
    /// Lower is better (more similar), so we negate the dot product.
    #[serde(alias = "dot")]
    InnerProduct,
}

impl DistanceFunction {
    /// Compute distance between two vectors.
    ///
    /// Returns a distance value where lower = more similar. Operand lengths
    /// are only checked in debug builds; use [`try_distance`](Self::try_distance)
    /// for caller-supplied input.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::Euclidean => euclidean_distance(a, b),
            Self::Cosine => cosine_distance(a, b),
            Self::InnerProduct => -inner_product(a, b),
        }
    }

    /// Compute distance, failing with `DimensionMismatch` if the operands
    /// disagree in length.
    pub fn try_distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        if a.len() != b.len() {
            return Err(VectorError::DimensionMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        Ok(self.distance(a, b))
    }

    /// Whether vectors are normalized to unit length on ingestion.
    ///
    /// Cosine distance over unit vectors reduces to `1 - dot`, which lets
    /// compressed distancers share the inner-product kernel.
    pub fn normalizes(&self) -> bool {
        matches!(self, Self::Cosine)
    }

    /// Stable lowercase name, used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Euclidean => "euclidean",
            Self::Cosine => "cosine",
            Self::InnerProduct => "inner_product",
        }
    }
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm = inner_product(vector, vector).sqrt();
    if norm < f32::EPSILON {
        return;
    }
    for v in vector.iter_mut() {
        *v /= norm;
    }
}

/// Euclidean (L2) distance: `sqrt(sum((a[i] - b[i])^2))`.
///
/// ```
/// use nori_vector::euclidean_distance;
///
/// let dist = euclidean_distance(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
/// assert!((dist - 5.196).abs() < 0.01); // sqrt(27)
/// ```
#[inline]
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    euclidean_distance_squared(a, b).sqrt()
}

/// Squared Euclidean distance. Preserves ordering, skips the sqrt.
#[inline]
pub fn euclidean_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    // Four independent accumulators keep the loop auto-vectorizable.
    let mut acc = [0.0f32; 4];
    let a_chunks = a.chunks_exact(4);
    let b_chunks = b.chunks_exact(4);
    let (a_rem, b_rem) = (a_chunks.remainder(), b_chunks.remainder());

    for (ca, cb) in a_chunks.zip(b_chunks) {
        for lane in 0..4 {
            let d = ca[lane] - cb[lane];
            acc[lane] += d * d;
        }
    }

    let tail: f32 = a_rem
        .iter()
        .zip(b_rem)
        .map(|(x, y)| (x - y) * (x - y))
        .sum();

    acc.iter().sum::<f32>() + tail
}

/// Cosine distance, `1 - cos(a, b)`, in `[0, 2]`.
///
/// Zero vectors have no direction; they are treated as orthogonal (1.0).
///
/// ```
/// use nori_vector::cosine_distance;
///
/// assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 0.001);
/// assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 0.001);
/// ```
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let (dot, norm_a, norm_b) = dot_and_norms(a, b);

    let denom = (norm_a * norm_b).sqrt();
    if denom < f32::EPSILON {
        return 1.0;
    }

    // Rounding can push the ratio slightly outside [-1, 1].
    1.0 - (dot / denom).clamp(-1.0, 1.0)
}

/// Inner (dot) product. Higher means more similar; negate for a distance.
///
/// ```
/// use nori_vector::inner_product;
///
/// assert!((inner_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]) - 32.0).abs() < 0.001);
/// ```
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let mut acc = [0.0f32; 4];
    let a_chunks = a.chunks_exact(4);
    let b_chunks = b.chunks_exact(4);
    let (a_rem, b_rem) = (a_chunks.remainder(), b_chunks.remainder());

    for (ca, cb) in a_chunks.zip(b_chunks) {
        for lane in 0..4 {
            acc[lane] += ca[lane] * cb[lane];
        }
    }

    let tail: f32 = a_rem.iter().zip(b_rem).map(|(x, y)| x * y).sum();
    acc.iter().sum::<f32>() + tail
}

/// Dot product and both squared norms in one pass: `(dot, |a|^2, |b|^2)`.
#[inline]
fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    a.iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (&x, &y)| {
            (dot + x * y, na + x * x, nb + y * y)
        })
}
