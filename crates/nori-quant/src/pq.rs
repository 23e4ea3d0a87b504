//! Product Quantization for memory-efficient vector compression.
//!
//! Product Quantization (PQ) compresses high-dimensional vectors into compact
//! codes while enabling fast approximate distance computation.
//!
//! # How It Works
//!
//! 1. **Split**: Divide vector into M subspaces (e.g., 128D → 16 x 8D)
//! 2. **Cluster**: K-means on each subspace to find K centroids (typically 256)
//! 3. **Encode**: Each subvector → nearest centroid ID (8 bits if K=256)
//! 4. **Distance**: Precompute query-to-centroid distances, lookup by code
//!
//! # Compression Ratio
//!
//! For 128D float32 vectors with M=16 subspaces, K=256 centroids:
//! - Original: 128 * 4 = 512 bytes
//! - Compressed: 16 * 1 = 16 bytes
//! - Ratio: 32x

use crate::{Kernel, QuantError, Result};
use nori_vector::{euclidean_distance_squared, inner_product};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Product Quantization configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PQConfig {
    /// Number of subspaces (M). Default: 16.
    /// Vector dimension must be divisible by this.
    pub num_subspaces: usize,

    /// Bits per code (determines K = 2^bits). Default: 8 (K=256).
    pub bits_per_code: usize,

    /// Number of k-means iterations for training. Default: 25.
    pub kmeans_iterations: usize,

    /// Sample size for training. Default: 10000.
    pub training_sample_size: usize,

    /// Number of indexed vectors that triggers automatic training.
    /// Default: 100000.
    pub training_limit: usize,
}

impl Default for PQConfig {
    fn default() -> Self {
        Self {
            num_subspaces: 16,
            bits_per_code: 8,
            kmeans_iterations: 25,
            training_sample_size: 10000,
            training_limit: 100_000,
        }
    }
}

impl PQConfig {
    /// Check the configuration against a dimensionality.
    pub fn validate(&self, dimensions: usize) -> Result<()> {
        if self.num_subspaces == 0 {
            return Err(QuantError::Training("num_subspaces must be > 0".into()));
        }
        if dimensions % self.num_subspaces != 0 {
            return Err(QuantError::Training(format!(
                "Dimensions {} not divisible by num_subspaces {}",
                dimensions, self.num_subspaces
            )));
        }
        if self.bits_per_code == 0 || self.bits_per_code > 8 {
            return Err(QuantError::Training(format!(
                "bits_per_code must be in 1..=8, got {}",
                self.bits_per_code
            )));
        }
        Ok(())
    }
}

/// Product Quantizer.
///
/// Codebooks are stored flat: centroid `c` of subspace `s` starts at
/// `(s * num_centroids + c) * subspace_dim`.
#[derive(Debug, Clone)]
pub struct ProductQuantizer {
    num_subspaces: usize,
    subspace_dim: usize,
    num_centroids: usize,
    codebooks: Vec<f32>,
    dimensions: usize,
}

impl ProductQuantizer {
    /// Train a Product Quantizer on a sample of vectors.
    pub fn train(vectors: &[Vec<f32>], dimensions: usize, config: &PQConfig) -> Result<Self> {
        config.validate(dimensions)?;
        if vectors.is_empty() {
            return Err(QuantError::Training("no training vectors".into()));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
            return Err(QuantError::InvalidDimension {
                expected: dimensions,
                actual: bad.len(),
            });
        }

        let num_subspaces = config.num_subspaces;
        let num_centroids = 1usize << config.bits_per_code;
        let subspace_dim = dimensions / num_subspaces;

        let training: Vec<&Vec<f32>> = if vectors.len() > config.training_sample_size {
            let mut rng = rand::thread_rng();
            let mut sample: Vec<&Vec<f32>> = vectors.iter().collect();
            sample.shuffle(&mut rng);
            sample.truncate(config.training_sample_size);
            sample
        } else {
            vectors.iter().collect()
        };

        let mut codebooks = Vec::with_capacity(num_subspaces * num_centroids * subspace_dim);
        for s in 0..num_subspaces {
            let range = s * subspace_dim..(s + 1) * subspace_dim;
            let subvectors: Vec<&[f32]> = training.iter().map(|v| &v[range.clone()]).collect();
            for centroid in kmeans(&subvectors, num_centroids, config.kmeans_iterations) {
                codebooks.extend_from_slice(&centroid);
            }
        }

        Ok(Self {
            num_subspaces,
            subspace_dim,
            num_centroids,
            codebooks,
            dimensions,
        })
    }

    #[inline]
    fn centroid(&self, subspace: usize, centroid: usize) -> &[f32] {
        let start = (subspace * self.num_centroids + centroid) * self.subspace_dim;
        &self.codebooks[start..start + self.subspace_dim]
    }

    /// Encode a vector to one centroid index per subspace.
    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != self.dimensions {
            return Err(QuantError::InvalidDimension {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }

        Ok((0..self.num_subspaces)
            .map(|s| {
                let sub = &vector[s * self.subspace_dim..(s + 1) * self.subspace_dim];
                self.nearest_centroid(s, sub) as u8
            })
            .collect())
    }

    fn nearest_centroid(&self, subspace: usize, subvector: &[f32]) -> usize {
        let mut best_idx = 0;
        let mut best_dist = f32::MAX;
        for c in 0..self.num_centroids {
            let dist = euclidean_distance_squared(subvector, self.centroid(subspace, c));
            if dist < best_dist {
                best_dist = dist;
                best_idx = c;
            }
        }
        best_idx
    }

    /// Reconstruct the approximate vector a code stands for.
    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.dimensions);
        for (s, &c) in code.iter().enumerate().take(self.num_subspaces) {
            out.extend_from_slice(self.centroid(s, c as usize));
        }
        out
    }

    /// Size of the per-query lookup table.
    pub fn table_len(&self) -> usize {
        self.num_subspaces * self.num_centroids
    }

    /// Fill `table[s * K + c]` with the query-to-centroid term for `kernel`.
    pub fn fill_table(&self, query: &[f32], kernel: Kernel, table: &mut Vec<f32>) {
        table.clear();
        table.reserve(self.table_len());
        for s in 0..self.num_subspaces {
            let sub = &query[s * self.subspace_dim..(s + 1) * self.subspace_dim];
            for c in 0..self.num_centroids {
                let centroid = self.centroid(s, c);
                table.push(match kernel {
                    Kernel::L2 => euclidean_distance_squared(sub, centroid),
                    Kernel::Dot => inner_product(sub, centroid),
                });
            }
        }
    }

    /// Sum the table entries selected by `code`.
    #[inline]
    pub fn sum_table(&self, table: &[f32], code: &[u8]) -> f32 {
        code.iter()
            .enumerate()
            .map(|(s, &c)| table[s * self.num_centroids + c as usize])
            .sum()
    }

    /// Get the number of subspaces.
    pub fn num_subspaces(&self) -> usize {
        self.num_subspaces
    }

    /// Get the number of centroids per subspace.
    pub fn num_centroids(&self) -> usize {
        self.num_centroids
    }

    /// Get the total dimensions.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Serialize the codebook: four little-endian u32 header fields followed
    /// by the flat centroid floats.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + self.codebooks.len() * 4);
        for field in [
            self.num_subspaces,
            self.subspace_dim,
            self.num_centroids,
            self.dimensions,
        ] {
            bytes.extend_from_slice(&(field as u32).to_le_bytes());
        }
        for &val in &self.codebooks {
            bytes.extend_from_slice(&val.to_le_bytes());
        }
        bytes
    }

    /// Deserialize a codebook written by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(QuantError::Serialization("PQ codebook too short".into()));
        }
        let header = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]) as usize
        };
        let num_subspaces = header(0);
        let subspace_dim = header(4);
        let num_centroids = header(8);
        let dimensions = header(12);

        let floats = num_subspaces * num_centroids * subspace_dim;
        if num_subspaces * subspace_dim != dimensions || bytes.len() != 16 + floats * 4 {
            return Err(QuantError::Serialization(format!(
                "PQ codebook length {} does not match header ({} subspaces x {} centroids x {} dims)",
                bytes.len(),
                num_subspaces,
                num_centroids,
                subspace_dim
            )));
        }

        let codebooks = bytes[16..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Self {
            num_subspaces,
            subspace_dim,
            num_centroids,
            codebooks,
            dimensions,
        })
    }
}

/// Simple k-means clustering (Lloyd iterations, random initial centroids).
fn kmeans(vectors: &[&[f32]], k: usize, iterations: usize) -> Vec<Vec<f32>> {
    if vectors.is_empty() || k == 0 {
        return vec![];
    }

    let dim = vectors[0].len();

    let mut rng = rand::thread_rng();
    let mut indices: Vec<usize> = (0..vectors.len()).collect();
    indices.shuffle(&mut rng);

    let mut centroids: Vec<Vec<f32>> = indices
        .into_iter()
        .take(k.min(vectors.len()))
        .map(|i| vectors[i].to_vec())
        .collect();

    // Fewer samples than centroids: duplicate the first so unused codes still
    // decode to something plausible.
    while centroids.len() < k {
        centroids.push(centroids[0].clone());
    }

    for _ in 0..iterations {
        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];

        for vector in vectors {
            let mut best = 0;
            let mut best_dist = f32::MAX;
            for (c, centroid) in centroids.iter().enumerate() {
                let dist = euclidean_distance_squared(vector, centroid);
                if dist < best_dist {
                    best_dist = dist;
                    best = c;
                }
            }
            counts[best] += 1;
            for (acc, v) in sums[best].iter_mut().zip(vector.iter()) {
                *acc += v;
            }
        }

        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            let n = counts[c] as f32;
            for (dst, sum) in centroids[c].iter_mut().zip(&sums[c]) {
                *dst = sum / n;
            }
        }
    }

    centroids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate_test_vectors(n: usize, dims: usize) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| (0..dims).map(|j| ((i * j) % 100) as f32 / 100.0).collect())
            .collect()
    }

    fn small_config(num_subspaces: usize) -> PQConfig {
        PQConfig {
            num_subspaces,
            bits_per_code: 8,
            kmeans_iterations: 5,
            training_sample_size: 500,
            training_limit: 1000,
        }
    }

    #[test]
    fn test_pq_train_and_encode() {
        let vectors = generate_test_vectors(600, 64);
        let pq = ProductQuantizer::train(&vectors, 64, &small_config(8)).unwrap();

        assert_eq!(pq.num_subspaces(), 8);
        assert_eq!(pq.num_centroids(), 256);
        assert_eq!(pq.dimensions(), 64);

        let code = pq.encode(&vectors[0]).unwrap();
        assert_eq!(code.len(), 8);
        assert_eq!(pq.decode(&code).len(), 64);
    }

    #[test]
    fn test_pq_rejects_wrong_dimension() {
        let vectors = generate_test_vectors(50, 16);
        let pq = ProductQuantizer::train(&vectors, 16, &small_config(4)).unwrap();

        let err = pq.encode(&[1.0; 8]).unwrap_err();
        assert!(matches!(
            err,
            QuantError::InvalidDimension {
                expected: 16,
                actual: 8
            }
        ));
    }

    #[test]
    fn test_pq_config_validation() {
        assert!(small_config(5).validate(64).is_err());
        assert!(small_config(0).validate(64).is_err());
        let mut cfg = small_config(8);
        cfg.bits_per_code = 9;
        assert!(cfg.validate(64).is_err());
        assert!(small_config(8).validate(64).is_ok());
    }

    #[test]
    fn test_pq_table_matches_decoded_distance() {
        let vectors = generate_test_vectors(400, 32);
        let pq = ProductQuantizer::train(&vectors, 32, &small_config(4)).unwrap();

        let query = &vectors[3];
        let code = pq.encode(&vectors[7]).unwrap();
        let decoded = pq.decode(&code);

        let mut table = Vec::new();
        pq.fill_table(query, Kernel::L2, &mut table);
        let via_table = pq.sum_table(&table, &code);
        let direct = euclidean_distance_squared(query, &decoded);
        assert!((via_table - direct).abs() < 1e-3);

        pq.fill_table(query, Kernel::Dot, &mut table);
        let via_table = pq.sum_table(&table, &code);
        let direct = inner_product(query, &decoded);
        assert!((via_table - direct).abs() < 1e-3);
    }

    #[test]
    fn test_pq_serialization() {
        let vectors = generate_test_vectors(500, 64);
        let pq = ProductQuantizer::train(&vectors, 64, &small_config(8)).unwrap();

        let pq2 = ProductQuantizer::from_bytes(&pq.to_bytes()).unwrap();

        assert_eq!(pq.num_subspaces(), pq2.num_subspaces());
        assert_eq!(pq.num_centroids(), pq2.num_centroids());
        assert_eq!(pq.dimensions(), pq2.dimensions());
        assert_eq!(pq.encode(&vectors[0]).unwrap(), pq2.encode(&vectors[0]).unwrap());
    }

    #[test]
    fn test_pq_from_truncated_bytes() {
        let vectors = generate_test_vectors(50, 16);
        let pq = ProductQuantizer::train(&vectors, 16, &small_config(4)).unwrap();
        let bytes = pq.to_bytes();

        assert!(ProductQuantizer::from_bytes(&bytes[..10]).is_err());
        assert!(ProductQuantizer::from_bytes(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_kmeans_basic() {
        let data = [[0.0f32, 0.0], [0.1, 0.1], [10.0, 10.0], [10.1, 10.1]];
        let vectors: Vec<&[f32]> = data.iter().map(|v| v.as_slice()).collect();

        let centroids = kmeans(&vectors, 2, 10);
        assert_eq!(centroids.len(), 2);

        // One centroid should be near (0, 0), other near (10, 10)
        let c1_near_zero = centroids[0][0] < 5.0;
        let c2_near_zero = centroids[1][0] < 5.0;
        assert_ne!(c1_near_zero, c2_near_zero);
    }
}
