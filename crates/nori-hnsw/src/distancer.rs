//! Distance computation over raw or compressed vectors.
//!
//! Search and insert code is written once against [`Space`]; whether a
//! distance comes from an f32 vector or from a quantized code is decided by
//! which variant the caller snapshotted.

use crate::graph::NodeId;
use nori_quant::{Compressor, CompressorDistancer, QuantError};
use nori_vector::DistanceFunction;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

type CacheShard = HashMap<NodeId, Arc<[f32]>>;

/// Raw vectors held in memory while the index is uncompressed.
pub struct VectorCache {
    shards: Vec<RwLock<CacheShard>>,
}

impl VectorCache {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    #[inline]
    fn shard(&self, id: NodeId) -> &RwLock<CacheShard> {
        &self.shards[(id % self.shards.len() as u64) as usize]
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<[f32]>> {
        self.shard(id).read().get(&id).cloned()
    }

    pub fn insert(&self, id: NodeId, vector: Arc<[f32]>) {
        self.shard(id).write().insert(id, vector);
    }

    pub fn remove(&self, id: NodeId) {
        self.shard(id).write().remove(&id);
    }

    /// Copy of every cached vector, used as a training sample.
    pub fn snapshot(&self) -> Vec<(NodeId, Arc<[f32]>)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().iter().map(|(&id, v)| (id, v.clone())));
        }
        out
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }
}

/// Where stored vectors live for the duration of one operation.
#[derive(Clone, Copy)]
pub enum Space<'a> {
    Raw {
        metric: DistanceFunction,
        cache: &'a VectorCache,
    },
    Compressed(&'a Compressor),
}

impl<'a> Space<'a> {
    /// Bind a query. Vectors passed in are already normalized for cosine.
    pub fn distancer(&self, query: &'a [f32]) -> Result<Distancer<'a>, QuantError> {
        Ok(match *self {
            Space::Raw { metric, cache } => Distancer::Raw {
                metric,
                query,
                cache,
            },
            Space::Compressed(compressor) => {
                Distancer::Compressed(compressor.new_distancer(query)?)
            }
        })
    }

    /// Distance between two stored nodes; `None` if either is gone.
    pub fn between(&self, a: NodeId, b: NodeId) -> Option<f32> {
        match *self {
            Space::Raw { metric, cache } => {
                let va = cache.get(a)?;
                let vb = cache.get(b)?;
                Some(metric.distance(&va, &vb))
            }
            Space::Compressed(compressor) => compressor.distance_between(a, b).ok(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Space::Compressed(_))
    }
}

/// A query bound to a [`Space`].
pub enum Distancer<'a> {
    Raw {
        metric: DistanceFunction,
        query: &'a [f32],
        cache: &'a VectorCache,
    },
    Compressed(CompressorDistancer<'a>),
}

impl Distancer<'_> {
    /// Distance from the query to a stored node.
    ///
    /// `None` when the node has no vector or code yet (or any more): the
    /// graph can reference an id that a concurrent insert has not finished
    /// materializing or that cleanup just reclaimed.
    #[inline]
    pub fn distance_to(&self, id: NodeId) -> Option<f32> {
        match self {
            Distancer::Raw {
                metric,
                query,
                cache,
            } => cache.get(id).map(|v| metric.distance(query, &v)),
            Distancer::Compressed(d) => d.distance_to(id).ok(),
        }
    }
}
