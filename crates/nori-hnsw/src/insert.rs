//! Insertion: level draw, neighbor selection, bidirectional linking,
//! entry-point promotion and re-insert repair.

use crate::config::UpdatePolicy;
use crate::distancer::Space;
use crate::graph::{Node, NodeId};
use crate::index::HnswIndex;
use crate::persist::id_key;
use crate::Result;
use nori_observe::{HnswEvt, HnswKind, VizEvent};
use nori_vector::Item;
use std::sync::Arc;

impl HnswIndex {
    /// Persist and index a prepared (validated, normalized) vector.
    ///
    /// The durable write happens only once the id is known to be absent or
    /// the cleanup lock is held; cleanup reclaims storage before it unlinks
    /// a node, so a write made after `contains` turned false cannot be
    /// deleted by a pass that is still running.
    pub(crate) fn index_vector(&self, id: NodeId, vector: Arc<[f32]>) -> Result<()> {
        if self.graph.contains(id) {
            return self.update_vector(id, vector);
        }
        self.store_vector(id, &vector)?;
        self.insert_new(id, vector)?;
        self.maybe_compress()
    }

    /// Keep the vector where distances will be computed from: the raw cache,
    /// or the code store once compression is active.
    fn stash_vector(&self, id: NodeId, vector: &Arc<[f32]>) -> Result<()> {
        let slot = self.compressor.read();
        match slot.as_ref() {
            Some(compressor) => {
                let code = compressor.insert(id, vector)?;
                self.buckets.compressed.put(&id_key(id), &code)?;
            }
            None => self.cache.insert(id, vector.clone()),
        }
        Ok(())
    }

    pub(crate) fn insert_new(&self, id: NodeId, vector: Arc<[f32]>) -> Result<()> {
        self.stash_vector(id, &vector)?;

        let first = self.graph.meta().entry_point.is_none();
        let level = if first { 0 } else { self.levels.draw() };

        if !self.graph.insert_node(id, Node::new(level)) {
            // a concurrent add of the same id won
            return self.update_vector(id, vector);
        }

        if first {
            let mut meta = self.graph.meta_mut();
            if meta.entry_point.is_none() {
                meta.entry_point = Some(id);
                meta.max_layer = level;
                drop(meta);
                self.entry_point_changed(id, level);
                return Ok(());
            }
        }

        self.link(id, &vector, level)?;
        self.promote(id, level);
        Ok(())
    }

    /// Re-insert of an id already in the graph.
    fn update_vector(&self, id: NodeId, vector: Arc<[f32]>) -> Result<()> {
        let cleanup_guard = self.cleanup_lock.lock();
        self.store_vector(id, &vector)?;

        // reclaimed by cleanup since the caller looked
        if !self.graph.contains(id) {
            drop(cleanup_guard);
            return self.insert_new(id, vector);
        }

        let revived = self.graph.tombstones_mut().remove(&id);
        if revived {
            self.buckets.tombstones.delete(&id_key(id))?;
            tracing::debug!(id, "re-insert cleared tombstone");
        }

        self.stash_vector(id, &vector)?;

        if revived || self.config.update_policy == UpdatePolicy::Repair {
            let level = self.graph.level_of(id).unwrap_or(0);
            self.link(id, &vector, level)?;
            self.promote(id, level);
        }

        self.report_gauges();
        Ok(())
    }

    /// Select and connect neighbors for `id` on layers `level..=0`.
    fn link(&self, id: NodeId, vector: &[f32], level: usize) -> Result<()> {
        self.with_space(|space| {
            let distancer = space.distancer(vector)?;
            let Some((entry, max_layer)) = self.entry_item(&distancer)? else {
                return Ok(());
            };

            let entry = self.descend(&distancer, entry, max_layer, level);
            let mut entries = vec![entry];
            let admit = |n: NodeId| n != id && !self.graph.is_tombstoned(n);

            for layer in (0..=level.min(max_layer)).rev() {
                let candidates = self
                    .search_layer(&distancer, &entries, self.config.ef_construction, layer, &admit)
                    .into_sorted_vec();

                let selected =
                    self.select_neighbors(&space, &candidates, self.config.max_degree(layer));
                self.connect(&space, id, layer, &selected);

                if !candidates.is_empty() {
                    entries = candidates;
                }
            }

            Ok(())
        })
    }

    /// Pick up to `m` neighbors from `candidates` (closest first).
    ///
    /// With the heuristic enabled a candidate is kept only if it is closer
    /// to the base node than to every neighbor already kept, which spreads
    /// edges across directions instead of clustering them.
    pub(crate) fn select_neighbors(
        &self,
        space: &Space<'_>,
        candidates: &[Item],
        m: usize,
    ) -> Vec<NodeId> {
        if !self.config.heuristic || candidates.len() <= m {
            return candidates.iter().take(m).map(|c| c.id).collect();
        }

        let mut selected: Vec<Item> = Vec::with_capacity(m);
        for candidate in candidates {
            if selected.len() >= m {
                break;
            }
            let diverse = selected.iter().all(|kept| {
                space
                    .between(candidate.id, kept.id)
                    .map(|d| candidate.dist < d)
                    .unwrap_or(true)
            });
            if diverse {
                selected.push(*candidate);
            }
        }

        selected.into_iter().map(|c| c.id).collect()
    }

    /// Set `id`'s list on `layer` and add the reverse edges, pruning any
    /// neighbor that goes over its cap.
    fn connect(&self, space: &Space<'_>, id: NodeId, layer: usize, selected: &[NodeId]) {
        self.graph.with_node_mut(id, |node| {
            if let Some(links) = node.links_at_mut(layer) {
                links.replace(selected.to_vec());
            }
        });

        let cap = self.config.max_degree(layer);
        for &neighbor in selected {
            let mut pair = self.graph.write_pair(id, neighbor);
            if let Some(node) = pair.node_mut(id) {
                self.add_edge(space, id, node, layer, neighbor, cap);
            }
            if let Some(node) = pair.node_mut(neighbor) {
                self.add_edge(space, neighbor, node, layer, id, cap);
            }
        }
    }

    /// Add `to` to `node`'s list on `layer`, re-pruning down to `cap`.
    pub(crate) fn add_edge(
        &self,
        space: &Space<'_>,
        node_id: NodeId,
        node: &mut Node,
        layer: usize,
        to: NodeId,
        cap: usize,
    ) {
        let Some(links) = node.links_at_mut(layer) else {
            return;
        };
        if !links.add(to) || links.len() <= cap {
            return;
        }

        let mut scored: Vec<Item> = links
            .as_slice()
            .iter()
            .filter_map(|&n| space.between(node_id, n).map(|d| Item::new(n, d)))
            .collect();
        scored.sort_by(Item::cmp_closest_first);
        links.replace(self.select_neighbors(space, &scored, cap));
    }

    /// Make `id` the entry point if it reaches above the current top layer.
    pub(crate) fn promote(&self, id: NodeId, level: usize) {
        let mut meta = self.graph.meta_mut();
        let promote = match meta.entry_point {
            None => true,
            Some(ep) => ep != id && level > meta.max_layer,
        };
        if !promote {
            return;
        }
        meta.entry_point = Some(id);
        meta.max_layer = level;
        drop(meta);

        tracing::debug!(id, level, "promoted entry point");
        self.entry_point_changed(id, level);
    }

    pub(crate) fn entry_point_changed(&self, id: NodeId, level: usize) {
        self.meter.emit(VizEvent::Hnsw(HnswEvt {
            index: self.name,
            kind: HnswKind::EntryPointChanged {
                node: id,
                layer: level as u32,
            },
        }));
    }
}

#[cfg(test)]
mod tests {
    use crate::{HnswConfig, HnswIndex};
    use nori_vector::{DistanceFunction, VectorIndex};

    fn config() -> HnswConfig {
        HnswConfig {
            m: 4,
            m_max0: 8,
            ef_construction: 32,
            seed: Some(11),
            lock_shards: 8,
            ..HnswConfig::new(2, DistanceFunction::Euclidean)
        }
    }

    #[test]
    fn test_first_node_is_entry_point() {
        let index = HnswIndex::in_memory(config()).unwrap();
        index.add(9, &[1.0, 1.0]).unwrap();
        assert_eq!(index.entry_point(), Some(9));
    }

    #[test]
    fn test_degree_caps_hold() {
        let index = HnswIndex::in_memory(config()).unwrap();
        for i in 0..200u64 {
            let x = (i % 20) as f32;
            let y = (i / 20) as f32;
            index.add(i, &[x, y]).unwrap();
        }

        index.graph.for_each_node(|_, node| {
            for (layer, links) in node.links.iter().enumerate() {
                let cap = if layer == 0 { 8 } else { 4 };
                assert!(links.len() <= cap, "layer {} has {} links", layer, links.len());
            }
        });
    }

    #[test]
    fn test_edges_are_added_both_ways() {
        let index = HnswIndex::in_memory(config()).unwrap();
        index.add(1, &[0.0, 0.0]).unwrap();
        index.add(2, &[1.0, 0.0]).unwrap();

        assert_eq!(index.graph.neighbors(1, 0), Some(vec![2]));
        assert_eq!(index.graph.neighbors(2, 0), Some(vec![1]));
    }

    #[test]
    fn test_heuristic_prefers_diverse_neighbors() {
        let index = HnswIndex::in_memory(config()).unwrap();
        let compressor = index.compressor_snapshot();
        let space = index.space(compressor.as_deref());

        // 2 and 3 sit together on one side of the base, 4 on the other
        for (id, v) in [(2u64, [1.0f32, 0.0]), (3, [1.1, 0.0]), (4, [-1.5, 0.0])] {
            index.cache.insert(id, std::sync::Arc::from(v.to_vec()));
        }
        let candidates = [
            nori_vector::Item::new(2, 1.0),
            nori_vector::Item::new(3, 1.1),
            nori_vector::Item::new(4, 1.5),
        ];

        let picked = index.select_neighbors(&space, &candidates, 2);
        assert_eq!(picked, vec![2, 4]);
    }
}
