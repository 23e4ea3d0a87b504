//! Scalar Quantization (SQ8): maps each f32 dimension to u8.
//!
//! Per-dimension `min`/`max` are learned from a training sample; encoding
//! maps `[min, max]` linearly onto `[0, 255]`. 4x compression.
//!
//! Codebook layout (little-endian):
//! ```text
//! [dimension: u32][min_0: f32][max_0: f32] ... [min_{d-1}: f32][max_{d-1}: f32]
//! ```

use crate::{Kernel, QuantError, Result};
use serde::{Deserialize, Serialize};

/// Scalar quantization configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SQConfig {
    /// Number of indexed vectors that triggers automatic training.
    pub training_limit: usize,
}

impl Default for SQConfig {
    fn default() -> Self {
        Self {
            training_limit: 100_000,
        }
    }
}

/// Per-dimension calibration for scalar quantization.
#[derive(Debug, Clone)]
pub struct ScalarQuantizer {
    dim: usize,
    mins: Vec<f32>,
    maxs: Vec<f32>,
    /// `(max - min) / 255` per dimension, 0 for constant dimensions.
    scales: Vec<f32>,
}

impl ScalarQuantizer {
    /// Calibrate from training vectors by computing per-dimension min/max.
    pub fn train(vectors: &[Vec<f32>], dim: usize) -> Result<Self> {
        if vectors.is_empty() {
            return Err(QuantError::Training("no training vectors".into()));
        }

        let mut mins = vec![f32::MAX; dim];
        let mut maxs = vec![f32::MIN; dim];

        for vec in vectors {
            if vec.len() != dim {
                return Err(QuantError::InvalidDimension {
                    expected: dim,
                    actual: vec.len(),
                });
            }
            for (d, &val) in vec.iter().enumerate() {
                mins[d] = mins[d].min(val);
                maxs[d] = maxs[d].max(val);
            }
        }

        Ok(Self::from_bounds(mins, maxs))
    }

    fn from_bounds(mins: Vec<f32>, maxs: Vec<f32>) -> Self {
        let scales = mins
            .iter()
            .zip(&maxs)
            .map(|(lo, hi)| {
                let range = hi - lo;
                if range < f32::EPSILON {
                    0.0
                } else {
                    range / 255.0
                }
            })
            .collect();

        Self {
            dim: mins.len(),
            mins,
            maxs,
            scales,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dim
    }

    /// Encode a vector. Values outside the calibrated range saturate.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != self.dim {
            return Err(QuantError::InvalidDimension {
                expected: self.dim,
                actual: vector.len(),
            });
        }

        Ok(vector
            .iter()
            .enumerate()
            .map(|(d, &v)| {
                if self.scales[d] == 0.0 {
                    return 0;
                }
                ((v - self.mins[d]) / self.scales[d]).round().clamp(0.0, 255.0) as u8
            })
            .collect())
    }

    /// Reconstruct approximate values.
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        code.iter()
            .enumerate()
            .map(|(d, &c)| self.mins[d] + c as f32 * self.scales[d])
            .collect()
    }

    /// Scratch size per query: one slot per dimension plus a constant term.
    pub fn table_len(&self) -> usize {
        self.dim + 1
    }

    /// Pre-transform the query so a code can be scored without decoding.
    ///
    /// - L2: `table[d] = q[d] - min[d]`, then `diff = table[d] - c * scale[d]`
    /// - Dot: `table[d] = q[d] * scale[d]`, `table[dim] = sum(q[d] * min[d])`
    pub fn fill_table(&self, query: &[f32], kernel: Kernel, table: &mut Vec<f32>) {
        table.clear();
        table.reserve(self.table_len());
        match kernel {
            Kernel::L2 => {
                table.extend(query.iter().zip(&self.mins).map(|(q, lo)| q - lo));
                table.push(0.0);
            }
            Kernel::Dot => {
                table.extend(query.iter().zip(&self.scales).map(|(q, s)| q * s));
                table.push(query.iter().zip(&self.mins).map(|(q, lo)| q * lo).sum());
            }
        }
    }

    /// Score a code against a table from [`fill_table`](Self::fill_table).
    /// L2 yields the squared distance, Dot the (positive) inner product.
    #[inline]
    pub fn score(&self, table: &[f32], code: &[u8], kernel: Kernel) -> f32 {
        match kernel {
            Kernel::L2 => code
                .iter()
                .enumerate()
                .map(|(d, &c)| {
                    let diff = table[d] - c as f32 * self.scales[d];
                    diff * diff
                })
                .sum(),
            Kernel::Dot => {
                let varying: f32 = code
                    .iter()
                    .enumerate()
                    .map(|(d, &c)| table[d] * c as f32)
                    .sum();
                varying + table[self.dim]
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.dim * 8);
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        for (lo, hi) in self.mins.iter().zip(&self.maxs) {
            bytes.extend_from_slice(&lo.to_le_bytes());
            bytes.extend_from_slice(&hi.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(QuantError::Serialization("SQ codebook too short".into()));
        }
        let dim = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() != 4 + dim * 8 {
            return Err(QuantError::Serialization(format!(
                "SQ codebook length {} does not match dimension {}",
                bytes.len(),
                dim
            )));
        }

        let mut mins = Vec::with_capacity(dim);
        let mut maxs = Vec::with_capacity(dim);
        for pair in bytes[4..].chunks_exact(8) {
            mins.push(f32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]));
            maxs.push(f32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]));
        }

        Ok(Self::from_bounds(mins, maxs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nori_vector::{euclidean_distance_squared, inner_product};

    fn sample() -> Vec<Vec<f32>> {
        (0..100)
            .map(|i| vec![i as f32 / 100.0, -(i as f32), 5.0, (i % 7) as f32])
            .collect()
    }

    #[test]
    fn test_encode_decode_close() {
        let vectors = sample();
        let sq = ScalarQuantizer::train(&vectors, 4).unwrap();

        for v in &vectors {
            let decoded = sq.decode(&sq.encode(v).unwrap());
            for (a, b) in v.iter().zip(&decoded) {
                assert!((a - b).abs() < 0.5, "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_constant_dimension() {
        let vectors = sample();
        let sq = ScalarQuantizer::train(&vectors, 4).unwrap();
        let code = sq.encode(&vectors[10]).unwrap();
        assert_eq!(code[2], 0);
        assert!((sq.decode(&code)[2] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_score_matches_decoded() {
        let vectors = sample();
        let sq = ScalarQuantizer::train(&vectors, 4).unwrap();
        let query = [0.3, -12.0, 4.0, 2.0];
        let code = sq.encode(&vectors[42]).unwrap();
        let decoded = sq.decode(&code);

        let mut table = Vec::new();
        sq.fill_table(&query, Kernel::L2, &mut table);
        let l2 = sq.score(&table, &code, Kernel::L2);
        assert!((l2 - euclidean_distance_squared(&query, &decoded)).abs() < 1e-2);

        sq.fill_table(&query, Kernel::Dot, &mut table);
        let dot = sq.score(&table, &code, Kernel::Dot);
        assert!((dot - inner_product(&query, &decoded)).abs() < 1e-2);
    }

    #[test]
    fn test_invalid_dimension() {
        let sq = ScalarQuantizer::train(&sample(), 4).unwrap();
        assert!(matches!(
            sq.encode(&[1.0, 2.0]),
            Err(QuantError::InvalidDimension {
                expected: 4,
                actual: 2
            })
        ));
        assert!(ScalarQuantizer::train(&[vec![1.0]], 4).is_err());
    }

    #[test]
    fn test_serialization() {
        let sq = ScalarQuantizer::train(&sample(), 4).unwrap();
        let restored = ScalarQuantizer::from_bytes(&sq.to_bytes()).unwrap();
        let v = [0.5, -50.0, 5.0, 3.0];
        assert_eq!(sq.encode(&v).unwrap(), restored.encode(&v).unwrap());
        assert!(ScalarQuantizer::from_bytes(&[1, 0, 0, 0, 9]).is_err());
    }
}
