//! Graph storage for HNSW.
//!
//! Nodes live in lock-striped shards keyed by id; neighbor lists hold ids,
//! never references, so reclaiming a node cannot leave a dangling pointer.
//! A separate structural lock guards the entry point, the top layer, the
//! node count and the compression flag.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Caller-assigned node id.
pub type NodeId = u64;

/// Neighbor list for a node at a specific layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbors {
    ids: Vec<NodeId>,
}

impl Neighbors {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: Vec::with_capacity(capacity),
        }
    }

    /// Returns false if already present.
    pub fn add(&mut self, id: NodeId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Returns false if not found.
    pub fn remove(&mut self, id: NodeId) -> bool {
        match self.ids.iter().position(|&x| x == id) {
            Some(pos) => {
                self.ids.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.contains(&id)
    }

    pub fn replace(&mut self, ids: Vec<NodeId>) {
        self.ids = ids;
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.ids
    }
}

impl From<Vec<NodeId>> for Neighbors {
    fn from(ids: Vec<NodeId>) -> Self {
        Self { ids }
    }
}

/// A node in the HNSW graph: one neighbor list per layer `0..=level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Highest layer this node occupies. Fixed at insert.
    pub level: usize,
    pub links: Vec<Neighbors>,
}

impl Node {
    pub fn new(level: usize) -> Self {
        Self {
            level,
            links: vec![Neighbors::default(); level + 1],
        }
    }

    pub fn links_at(&self, layer: usize) -> Option<&Neighbors> {
        self.links.get(layer)
    }

    pub fn links_at_mut(&mut self, layer: usize) -> Option<&mut Neighbors> {
        self.links.get_mut(layer)
    }
}

/// Structural metadata, guarded by the global lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Meta {
    pub entry_point: Option<NodeId>,
    /// Level of the entry point.
    pub max_layer: usize,
    pub size: usize,
    pub compressed: bool,
}

type Shard = HashMap<NodeId, Node>;

pub struct Graph {
    shards: Vec<RwLock<Shard>>,
    meta: RwLock<Meta>,
    tombstones: RwLock<HashSet<NodeId>>,
}

impl Graph {
    pub fn new(lock_shards: usize) -> Self {
        Self {
            shards: (0..lock_shards.max(1))
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            meta: RwLock::new(Meta::default()),
            tombstones: RwLock::new(HashSet::new()),
        }
    }

    #[inline]
    fn shard_index(&self, id: NodeId) -> usize {
        (id % self.shards.len() as u64) as usize
    }

    #[inline]
    pub fn shard(&self, id: NodeId) -> &RwLock<Shard> {
        &self.shards[self.shard_index(id)]
    }

    /// Snapshot of the structural metadata.
    pub fn meta(&self) -> Meta {
        *self.meta.read()
    }

    pub fn meta_mut(&self) -> RwLockWriteGuard<'_, Meta> {
        self.meta.write()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.shard(id).read().contains_key(&id)
    }

    pub fn level_of(&self, id: NodeId) -> Option<usize> {
        self.shard(id).read().get(&id).map(|n| n.level)
    }

    /// Copy of a node's neighbor ids at `layer`.
    ///
    /// `None` if the node is absent or does not reach `layer`.
    pub fn neighbors(&self, id: NodeId, layer: usize) -> Option<Vec<NodeId>> {
        let shard = self.shard(id).read();
        shard
            .get(&id)
            .and_then(|n| n.links_at(layer))
            .map(|l| l.as_slice().to_vec())
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.shard(id).read().get(&id).cloned()
    }

    /// Insert a node. Returns false if the id is already present.
    pub fn insert_node(&self, id: NodeId, node: Node) -> bool {
        let mut shard = self.shard(id).write();
        if shard.contains_key(&id) {
            return false;
        }
        shard.insert(id, node);
        drop(shard);
        self.meta.write().size += 1;
        true
    }

    pub fn remove_node(&self, id: NodeId) -> Option<Node> {
        let mut meta = self.meta.write();
        self.remove_node_locked(id, &mut meta)
    }

    /// Remove a node while the caller already holds the structural lock.
    pub fn remove_node_locked(&self, id: NodeId, meta: &mut Meta) -> Option<Node> {
        let removed = self.shard(id).write().remove(&id);
        if removed.is_some() {
            meta.size = meta.size.saturating_sub(1);
        }
        removed
    }

    /// Run `f` with exclusive access to one node.
    pub fn with_node_mut<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        let mut shard = self.shard(id).write();
        shard.get_mut(&id).map(f)
    }

    /// Write-lock the shards of two nodes in ascending shard order.
    pub fn write_pair(&self, a: NodeId, b: NodeId) -> PairGuard<'_> {
        let (ia, ib) = (self.shard_index(a), self.shard_index(b));
        let (lo, hi) = if ia <= ib { (ia, ib) } else { (ib, ia) };
        let first = self.shards[lo].write();
        let second = (hi != lo).then(|| self.shards[hi].write());
        PairGuard {
            graph: self,
            first_index: lo,
            first,
            second,
        }
    }

    /// Every node id, shard by shard.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.meta.read().size);
        for shard in &self.shards {
            ids.extend(shard.read().keys().copied());
        }
        ids
    }

    /// Visit every node under its shard's read lock.
    pub fn for_each_node(&self, mut f: impl FnMut(NodeId, &Node)) {
        for shard in &self.shards {
            let shard = shard.read();
            for (&id, node) in shard.iter() {
                f(id, node);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.meta.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tombstoned(&self, id: NodeId) -> bool {
        self.tombstones.read().contains(&id)
    }

    pub fn tombstones(&self) -> RwLockReadGuard<'_, HashSet<NodeId>> {
        self.tombstones.read()
    }

    pub fn tombstones_mut(&self) -> RwLockWriteGuard<'_, HashSet<NodeId>> {
        self.tombstones.write()
    }

    /// Highest-level live node, ties broken by smallest id.
    pub fn best_live_node(&self) -> Option<(NodeId, usize)> {
        let tombstones = self.tombstones.read();
        let mut best: Option<(NodeId, usize)> = None;
        self.for_each_node(|id, node| {
            if tombstones.contains(&id) {
                return;
            }
            let better = match best {
                None => true,
                Some((best_id, best_level)) => {
                    node.level > best_level || (node.level == best_level && id < best_id)
                }
            };
            if better {
                best = Some((id, node.level));
            }
        });
        best
    }

    /// Drop every node and tombstone. The compression flag survives.
    pub fn clear(&self) {
        let mut meta = self.meta.write();
        for shard in &self.shards {
            shard.write().clear();
        }
        self.tombstones.write().clear();
        meta.entry_point = None;
        meta.max_layer = 0;
        meta.size = 0;
    }
}

/// Exclusive access to the shards holding two nodes.
pub struct PairGuard<'a> {
    graph: &'a Graph,
    first_index: usize,
    first: RwLockWriteGuard<'a, Shard>,
    second: Option<RwLockWriteGuard<'a, Shard>>,
}

impl PairGuard<'_> {
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        if self.graph.shard_index(id) == self.first_index {
            self.first.get_mut(&id)
        } else {
            self.second.as_mut()?.get_mut(&id)
        }
    }
}
