//! Durability through the [`KvStore`] buckets and startup rebuild.
//!
//! Layout (keys are big-endian ids so cursors walk them in id order):
//!
//! | bucket       | key        | value                          |
//! |--------------|------------|--------------------------------|
//! | `vectors`    | id         | raw f32 vector, little-endian  |
//! | `compressed` | id         | quantized code                 |
//! | `tombstones` | id         | empty                          |
//! | `graph`      | id         | bincode [`Node`] snapshot      |
//! | `meta`       | `codebook` | trained codebook               |
//! | `meta`       | `graph`    | bincode [`SnapshotMeta`]       |
//!
//! Raw vectors are written on every insert and are the source of truth.
//! Codes and tombstones are written as they change. The graph snapshot is
//! only written by [`HnswIndex::flush`]; vectors inserted after the last
//! flush are re-linked on startup.

use crate::graph::{Node, NodeId};
use crate::index::HnswIndex;
use crate::store::{Bucket, KvStore};
use crate::{HnswError, Result};
use bytes::Bytes;
use nori_quant::{Codebook, Compressor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

pub(crate) const CODEBOOK_KEY: &[u8] = b"codebook";
const SNAPSHOT_KEY: &[u8] = b"graph";

/// Handles to the named buckets.
pub(crate) struct Buckets {
    pub vectors: Arc<dyn Bucket>,
    pub compressed: Arc<dyn Bucket>,
    pub tombstones: Arc<dyn Bucket>,
    pub graph: Arc<dyn Bucket>,
    pub meta: Arc<dyn Bucket>,
}

impl Buckets {
    pub fn open(store: &dyn KvStore) -> Result<Self> {
        Ok(Self {
            vectors: store.create_or_load_bucket("vectors")?,
            compressed: store.create_or_load_bucket("compressed")?,
            tombstones: store.create_or_load_bucket("tombstones")?,
            graph: store.create_or_load_bucket("graph")?,
            meta: store.create_or_load_bucket("meta")?,
        })
    }

    fn all(&self) -> [&Arc<dyn Bucket>; 5] {
        [
            &self.vectors,
            &self.compressed,
            &self.tombstones,
            &self.graph,
            &self.meta,
        ]
    }

    pub fn clear_all(&self) -> Result<()> {
        for bucket in self.all() {
            bucket.clear()?;
        }
        Ok(())
    }
}

/// Entry point and top layer at the time of the last flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SnapshotMeta {
    pub entry_point: Option<NodeId>,
    pub max_layer: usize,
}

#[inline]
pub(crate) fn id_key(id: NodeId) -> [u8; 8] {
    id.to_be_bytes()
}

pub(crate) fn decode_id(key: &[u8]) -> Result<NodeId> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| {
        HnswError::Serialization(format!("id key must be 8 bytes, got {}", key.len()))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn decode_vector(bytes: &[u8], dimensions: usize) -> Result<Vec<f32>> {
    if bytes.len() != dimensions * 4 {
        return Err(HnswError::Serialization(format!(
            "stored vector has {} bytes, expected {}",
            bytes.len(),
            dimensions * 4
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| HnswError::Serialization(e.to_string()))
}

fn deserialize<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| HnswError::Serialization(e.to_string()))
}

/// Drain a bucket through its cursor.
fn scan_bucket(bucket: &dyn Bucket) -> Result<Vec<(Bytes, Bytes)>> {
    let mut cursor = bucket.cursor()?;
    let mut out = Vec::new();
    let mut entry = cursor.first()?;
    while let Some(kv) = entry {
        out.push(kv);
        entry = cursor.next()?;
    }
    Ok(out)
}

impl HnswIndex {
    pub(crate) fn store_vector(&self, id: NodeId, vector: &[f32]) -> Result<()> {
        self.buckets.vectors.put(&id_key(id), &encode_vector(vector))
    }

    /// The durable full-precision vector for `id`, if any.
    pub(crate) fn load_vector(&self, id: NodeId) -> Result<Option<Vec<f32>>> {
        match self.buckets.vectors.get(&id_key(id))? {
            Some(bytes) => Ok(Some(decode_vector(&bytes, self.config.dimensions)?)),
            None => Ok(None),
        }
    }

    /// Write the graph snapshot: every node's level and links, plus the
    /// entry point.
    pub fn flush(&self) -> Result<()> {
        self.buckets.graph.clear()?;

        let mut nodes = Vec::with_capacity(self.graph.len());
        self.graph.for_each_node(|id, node| nodes.push((id, node.clone())));
        for (id, node) in &nodes {
            self.buckets.graph.put(&id_key(*id), &serialize(node)?)?;
        }

        let meta = self.graph.meta();
        let snapshot = SnapshotMeta {
            entry_point: meta.entry_point,
            max_layer: meta.max_layer,
        };
        self.buckets.meta.put(SNAPSHOT_KEY, &serialize(&snapshot)?)?;

        tracing::debug!(nodes = nodes.len(), "flushed graph snapshot");
        Ok(())
    }

    /// Rebuild memory from the store.
    ///
    /// Codebook and codes come back first so distances are available, then
    /// vectors, the graph snapshot and tombstones. Vectors without a
    /// snapshot entry are inserted afresh. Store errors abort the rebuild.
    pub(crate) fn restore(&self) -> Result<()> {
        let cleanup = self.cleanup_lock.lock();
        let compress = self.compress_lock.lock();

        let outcome = self.restore_locked();
        drop(compress);
        drop(cleanup);

        match outcome {
            Ok(()) => self.maybe_compress(),
            Err(e) => {
                tracing::warn!(error = %e, "hnsw startup rebuild failed");
                Err(e)
            }
        }
    }

    fn restore_locked(&self) -> Result<()> {
        {
            let mut slot = self.compressor.write();
            *slot = None;
            self.graph.clear();
            self.graph.meta_mut().compressed = false;
            self.cache.clear();
        }

        let compressor = match self.buckets.meta.get(CODEBOOK_KEY)? {
            Some(bytes) => {
                let codebook = Codebook::from_bytes(&bytes)?;
                Some(Arc::new(Compressor::from_codebook(
                    self.config.distance,
                    codebook,
                )))
            }
            None => None,
        };

        if let Some(compressor) = &compressor {
            for (key, code) in scan_bucket(self.buckets.compressed.as_ref())? {
                compressor.preload(decode_id(&key)?, code.to_vec());
            }
        }

        let mut vector_ids = HashSet::new();
        for (key, bytes) in scan_bucket(self.buckets.vectors.as_ref())? {
            let id = decode_id(&key)?;
            let vector = decode_vector(&bytes, self.config.dimensions)?;
            match &compressor {
                Some(compressor) if !compressor.contains(id) => {
                    let code = compressor.insert(id, &vector)?;
                    self.buckets.compressed.put(&key, &code)?;
                }
                Some(_) => {}
                None => self.cache.insert(id, Arc::from(vector)),
            }
            vector_ids.insert(id);
        }

        if let Some(compressor) = compressor {
            *self.compressor.write() = Some(compressor);
            self.graph.meta_mut().compressed = true;
        }

        let tombstoned: Vec<NodeId> = scan_bucket(self.buckets.tombstones.as_ref())?
            .iter()
            .map(|(key, _)| decode_id(key))
            .collect::<Result<_>>()?;

        let mut restored = 0;
        for (key, bytes) in scan_bucket(self.buckets.graph.as_ref())? {
            let id = decode_id(&key)?;
            if !vector_ids.contains(&id) {
                return Err(HnswError::Invariant(format!(
                    "graph snapshot has node {} without a stored vector",
                    id
                )));
            }
            let node: Node = deserialize(&bytes)?;
            self.graph.insert_node(id, node);
            restored += 1;
        }

        // drop links to nodes that never made it into the snapshot
        let present: HashSet<NodeId> = self.graph.ids().into_iter().collect();
        for &id in &present {
            self.graph.with_node_mut(id, |node| {
                for links in &mut node.links {
                    let kept: Vec<NodeId> = links
                        .as_slice()
                        .iter()
                        .copied()
                        .filter(|n| *n != id && present.contains(n))
                        .collect();
                    links.replace(kept);
                }
            });
        }

        if let Some(bytes) = self.buckets.meta.get(SNAPSHOT_KEY)? {
            let snapshot: SnapshotMeta = deserialize(&bytes)?;
            let mut meta = self.graph.meta_mut();
            match snapshot.entry_point {
                Some(ep) if self.graph.contains(ep) => {
                    meta.entry_point = Some(ep);
                    meta.max_layer = snapshot.max_layer;
                }
                _ => {
                    meta.entry_point = None;
                    meta.max_layer = 0;
                }
            }
        }

        // before relinking, so late vectors never pick a deleted neighbor
        {
            let mut tombstones = self.graph.tombstones_mut();
            for id in &tombstoned {
                if vector_ids.contains(id) {
                    tombstones.insert(*id);
                }
            }
        }

        // everything else in `vectors` was added after the last flush
        let mut relinked = 0;
        let mut pending: Vec<NodeId> = vector_ids
            .iter()
            .copied()
            .filter(|id| !self.graph.contains(*id))
            .collect();
        pending.sort_unstable();

        // need an entry point before linking anything
        if !self.graph.is_empty() && self.graph.meta().entry_point.is_none() {
            self.elect_any_entry_point();
        }

        for id in pending {
            let vector = match self.load_vector(id)? {
                Some(v) => Arc::from(v),
                None => continue,
            };
            self.insert_new(id, vector)?;
            relinked += 1;
        }

        for id in &tombstoned {
            if !self.graph.contains(*id) {
                self.buckets.tombstones.delete(&id_key(*id))?;
            }
        }

        self.reelect_entry_point();
        if self.reset_if_all_tombstoned()? {
            tracing::info!("every restored node was deleted");
        }

        self.report_gauges();
        tracing::info!(
            restored,
            relinked,
            tombstones = self.tombstone_count(),
            compressed = self.graph.meta().compressed,
            "hnsw index rebuilt from store"
        );
        Ok(())
    }

    /// Pick the highest-level node regardless of tombstones.
    fn elect_any_entry_point(&self) {
        let mut best: Option<(NodeId, usize)> = None;
        self.graph.for_each_node(|id, node| {
            let better = match best {
                None => true,
                Some((b, level)) => node.level > level || (node.level == level && id < b),
            };
            if better {
                best = Some((id, node.level));
            }
        });
        if let Some((id, level)) = best {
            let mut meta = self.graph.meta_mut();
            meta.entry_point = Some(id);
            meta.max_layer = level;
        }
    }
}
