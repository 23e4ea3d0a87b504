//! Code store and per-query distancers over a trained codebook.

use crate::pq::ProductQuantizer;
use crate::sq::ScalarQuantizer;
use crate::{CompressionConfig, Kernel, QuantError, Result};
use nori_vector::{euclidean_distance_squared, inner_product, DistanceFunction};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

const CODE_SHARDS: usize = 64;
const TAG_PRODUCT: u8 = 1;
const TAG_SCALAR: u8 = 2;

/// A trained codec.
#[derive(Debug, Clone)]
pub enum Codebook {
    Product(ProductQuantizer),
    Scalar(ScalarQuantizer),
}

impl Codebook {
    pub fn dimensions(&self) -> usize {
        match self {
            Codebook::Product(pq) => pq.dimensions(),
            Codebook::Scalar(sq) => sq.dimensions(),
        }
    }

    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        match self {
            Codebook::Product(pq) => pq.encode(vector),
            Codebook::Scalar(sq) => sq.encode(vector),
        }
    }

    pub fn decode(&self, code: &[u8]) -> Vec<f32> {
        match self {
            Codebook::Product(pq) => pq.decode(code),
            Codebook::Scalar(sq) => sq.decode(code),
        }
    }

    fn table_len(&self) -> usize {
        match self {
            Codebook::Product(pq) => pq.table_len(),
            Codebook::Scalar(sq) => sq.table_len(),
        }
    }

    fn fill_table(&self, query: &[f32], kernel: Kernel, table: &mut Vec<f32>) {
        match self {
            Codebook::Product(pq) => pq.fill_table(query, kernel, table),
            Codebook::Scalar(sq) => sq.fill_table(query, kernel, table),
        }
    }

    #[inline]
    fn score(&self, table: &[f32], code: &[u8], kernel: Kernel) -> f32 {
        match self {
            Codebook::Product(pq) => pq.sum_table(table, code),
            Codebook::Scalar(sq) => sq.score(table, code, kernel),
        }
    }

    /// One tag byte followed by the codec's own encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (tag, body) = match self {
            Codebook::Product(pq) => (TAG_PRODUCT, pq.to_bytes()),
            Codebook::Scalar(sq) => (TAG_SCALAR, sq.to_bytes()),
        };
        let mut bytes = Vec::with_capacity(1 + body.len());
        bytes.push(tag);
        bytes.extend_from_slice(&body);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&TAG_PRODUCT, body)) => Ok(Codebook::Product(ProductQuantizer::from_bytes(body)?)),
            Some((&TAG_SCALAR, body)) => Ok(Codebook::Scalar(ScalarQuantizer::from_bytes(body)?)),
            Some((tag, _)) => Err(QuantError::Serialization(format!(
                "unknown codebook tag {}",
                tag
            ))),
            None => Err(QuantError::Serialization("empty codebook".into())),
        }
    }
}

fn kernel_for(metric: DistanceFunction) -> Kernel {
    match metric {
        DistanceFunction::Euclidean => Kernel::L2,
        DistanceFunction::Cosine | DistanceFunction::InnerProduct => Kernel::Dot,
    }
}

/// Map a raw kernel score back onto the metric's distance.
///
/// Cosine inputs are expected to be unit length already.
#[inline]
fn finish(metric: DistanceFunction, raw: f32) -> f32 {
    match metric {
        DistanceFunction::Euclidean => raw.max(0.0).sqrt(),
        DistanceFunction::Cosine => 1.0 - raw,
        DistanceFunction::InnerProduct => -raw,
    }
}

/// Compressed codes for every indexed id plus the codebook that made them.
///
/// Codes are sharded by id so inserts on different ids rarely contend.
pub struct Compressor {
    metric: DistanceFunction,
    kernel: Kernel,
    codebook: Codebook,
    codes: Vec<RwLock<HashMap<u64, Box<[u8]>>>>,
    /// Reusable lookup tables, returned when a distancer drops.
    scratch: Mutex<Vec<Vec<f32>>>,
}

impl Compressor {
    /// Train a codebook from `training` according to `config`.
    pub fn train(
        config: &CompressionConfig,
        metric: DistanceFunction,
        training: &[Vec<f32>],
        dimensions: usize,
    ) -> Result<Self> {
        let codebook = match config {
            CompressionConfig::None => {
                return Err(QuantError::Training("compression is disabled".into()))
            }
            CompressionConfig::Product(pq) => {
                Codebook::Product(ProductQuantizer::train(training, dimensions, pq)?)
            }
            CompressionConfig::Scalar(_) => {
                Codebook::Scalar(ScalarQuantizer::train(training, dimensions)?)
            }
        };

        tracing::debug!(
            vectors = training.len(),
            dimensions,
            metric = metric.name(),
            "trained codebook"
        );

        Ok(Self::from_codebook(metric, codebook))
    }

    /// Wrap an already trained codebook (e.g. one loaded from disk).
    pub fn from_codebook(metric: DistanceFunction, codebook: Codebook) -> Self {
        Self {
            metric,
            kernel: kernel_for(metric),
            codebook,
            codes: (0..CODE_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            scratch: Mutex::new(Vec::new()),
        }
    }

    pub fn codebook(&self) -> &Codebook {
        &self.codebook
    }

    pub fn metric(&self) -> DistanceFunction {
        self.metric
    }

    #[inline]
    fn shard(&self, id: u64) -> &RwLock<HashMap<u64, Box<[u8]>>> {
        &self.codes[(id % CODE_SHARDS as u64) as usize]
    }

    pub fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        self.codebook.encode(vector)
    }

    /// Encode and store `vector` under `id`, returning the code.
    pub fn insert(&self, id: u64, vector: &[f32]) -> Result<Vec<u8>> {
        let code = self.codebook.encode(vector)?;
        self.shard(id).write().insert(id, code.clone().into_boxed_slice());
        Ok(code)
    }

    /// Store a code produced earlier (startup restore).
    pub fn preload(&self, id: u64, code: Vec<u8>) {
        self.shard(id).write().insert(id, code.into_boxed_slice());
    }

    pub fn remove(&self, id: u64) {
        self.shard(id).write().remove(&id);
    }

    /// Drop every stored code; the codebook stays.
    pub fn clear(&self) {
        for shard in &self.codes {
            shard.write().clear();
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.shard(id).read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.codes.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.iter().all(|s| s.read().is_empty())
    }

    /// Bytes per stored code.
    pub fn code_len(&self) -> usize {
        match &self.codebook {
            Codebook::Product(pq) => pq.num_subspaces(),
            Codebook::Scalar(sq) => sq.dimensions(),
        }
    }

    /// Approximate distance between two stored codes, computed over their
    /// reconstructions.
    pub fn distance_between(&self, a: u64, b: u64) -> Result<f32> {
        let va = self.decoded(a)?;
        let vb = self.decoded(b)?;
        let raw = match self.kernel {
            Kernel::L2 => euclidean_distance_squared(&va, &vb),
            Kernel::Dot => inner_product(&va, &vb),
        };
        Ok(finish(self.metric, raw))
    }

    fn decoded(&self, id: u64) -> Result<Vec<f32>> {
        let shard = self.shard(id).read();
        let code = shard.get(&id).ok_or(QuantError::MissingCode(id))?;
        Ok(self.codebook.decode(code))
    }

    /// A distancer for one query. The lookup table is borrowed from a pool
    /// and handed back when the distancer is dropped.
    pub fn new_distancer(&self, query: &[f32]) -> Result<CompressorDistancer<'_>> {
        let dimensions = self.codebook.dimensions();
        if query.len() != dimensions {
            return Err(QuantError::InvalidDimension {
                expected: dimensions,
                actual: query.len(),
            });
        }

        let mut table = self
            .scratch
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.codebook.table_len()));
        self.codebook.fill_table(query, self.kernel, &mut table);

        Ok(CompressorDistancer {
            compressor: self,
            table,
        })
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("metric", &self.metric)
            .field("codebook", &self.codebook)
            .field("codes", &self.len())
            .finish()
    }
}

/// Scores stored codes against one query.
pub struct CompressorDistancer<'a> {
    compressor: &'a Compressor,
    table: Vec<f32>,
}

impl CompressorDistancer<'_> {
    /// Distance from the query to the code stored under `id`.
    pub fn distance_to(&self, id: u64) -> Result<f32> {
        let shard = self.compressor.shard(id).read();
        let code = shard.get(&id).ok_or(QuantError::MissingCode(id))?;
        Ok(self.distance_to_code(code))
    }

    /// Distance from the query to an arbitrary code.
    #[inline]
    pub fn distance_to_code(&self, code: &[u8]) -> f32 {
        let c = self.compressor;
        finish(c.metric, c.codebook.score(&self.table, code, c.kernel))
    }
}

impl Drop for CompressorDistancer<'_> {
    fn drop(&mut self) {
        let table = std::mem::take(&mut self.table);
        self.compressor.scratch.lock().push(table);
    }
}
