//! Soft deletes and tombstone cleanup.
//!
//! `delete` only marks ids; they stay traversable so the graph keeps its
//! connectivity. `cleanup_tombstones` later unlinks them, refills the
//! neighbor lists that pointed at them and reclaims their storage.

use crate::graph::NodeId;
use crate::index::HnswIndex;
use crate::persist::id_key;
use crate::Result;
use nori_observe::{obs_count, HnswEvt, HnswKind, VizEvent};
use nori_vector::Item;
use std::collections::HashSet;

impl HnswIndex {
    pub(crate) fn delete_ids(&self, ids: &[u64]) -> Result<()> {
        let mut marked = Vec::with_capacity(ids.len());
        {
            let mut tombstones = self.graph.tombstones_mut();
            for &id in ids {
                if self.graph.contains(id) && tombstones.insert(id) {
                    marked.push(id);
                }
            }
        }

        if marked.is_empty() {
            return Ok(());
        }

        for &id in &marked {
            self.buckets.tombstones.put(&id_key(id), &[])?;
        }
        obs_count!(self.meter, "hnsw_deletes_total", &[], marked.len());
        tracing::debug!(count = marked.len(), "tombstoned");

        let size = self.graph.len();
        let all_deleted = self.graph.tombstones().len() >= size;
        if all_deleted {
            let _cleanup = self.cleanup_lock.lock();
            if self.reset_if_all_tombstoned()? {
                self.report_gauges();
                return Ok(());
            }
        }

        let ep = self.graph.meta().entry_point;
        if ep.map(|ep| marked.contains(&ep)).unwrap_or(false) {
            self.reelect_entry_point();
        }

        self.report_gauges();
        Ok(())
    }

    /// Replace a tombstoned or reclaimed entry point with the highest-level
    /// live node.
    ///
    /// The candidate is chosen without the structural lock, which is taken
    /// only to swap. If the candidate died in between, the scan runs again.
    pub(crate) fn reelect_entry_point(&self) {
        loop {
            if !self.entry_point_stale() {
                return;
            }
            let elected = self.graph.best_live_node();

            let mut meta = self.graph.meta_mut();
            let stale = match meta.entry_point {
                None => meta.size > 0,
                Some(ep) => self.graph.is_tombstoned(ep) || !self.graph.contains(ep),
            };
            if !stale {
                return;
            }
            match elected {
                Some((id, _)) if self.graph.is_tombstoned(id) || !self.graph.contains(id) => {
                    drop(meta);
                    tracing::debug!(id, "elected entry point died, rescanning");
                    continue;
                }
                Some((id, level)) => {
                    meta.entry_point = Some(id);
                    meta.max_layer = level;
                    drop(meta);
                    tracing::info!(id, level, "re-elected entry point");
                    self.entry_point_changed(id, level);
                }
                None if meta.size > self.graph.tombstones().len() => {
                    drop(meta);
                    continue;
                }
                None => {
                    meta.entry_point = None;
                    meta.max_layer = 0;
                }
            }
            return;
        }
    }

    fn entry_point_stale(&self) -> bool {
        let meta = self.graph.meta();
        match meta.entry_point {
            None => meta.size > 0,
            Some(ep) => self.graph.is_tombstoned(ep) || !self.graph.contains(ep),
        }
    }

    /// Reclaim every node at once when none is live. Caller holds the
    /// cleanup lock. Returns whether a reset happened.
    pub(crate) fn reset_if_all_tombstoned(&self) -> Result<bool> {
        let ids = {
            let tombstones = self.graph.tombstones();
            let mut all = true;
            let mut ids = Vec::new();
            self.graph.for_each_node(|id, _| {
                if tombstones.contains(&id) {
                    ids.push(id);
                } else {
                    all = false;
                }
            });
            if !all || ids.is_empty() {
                return Ok(false);
            }
            ids
        };

        // Only a re-insert can revive a tombstone, and re-inserts wait on the
        // cleanup lock, so `ids` stays tombstoned until removed below.
        for &id in &ids {
            self.reclaim_storage(id)?;
        }

        let stranded = {
            let mut meta = self.graph.meta_mut();
            let mut tombstones = self.graph.tombstones_mut();
            for &id in &ids {
                self.graph.remove_node_locked(id, &mut meta);
                tombstones.remove(&id);
            }
            let stranded = meta.entry_point.map_or(false, |ep| ids.contains(&ep));
            if stranded {
                meta.entry_point = None;
                meta.max_layer = 0;
            }
            stranded && meta.size > 0
        };
        // a fresh insert landed while storage was being reclaimed
        if stranded {
            self.reelect_entry_point();
        }

        obs_count!(self.meter, "hnsw_tombstones_cleaned_total", &[], ids.len());
        self.meter.emit(VizEvent::Hnsw(HnswEvt {
            index: self.name,
            kind: HnswKind::Reset,
        }));
        tracing::info!(reclaimed = ids.len(), "every node deleted, graph reset");
        Ok(true)
    }

    /// Remove one unlinked node. Caller holds the cleanup lock.
    ///
    /// Storage goes first: once the node leaves the graph a concurrent add
    /// of the same id takes the fresh-insert path and writes its vector
    /// again, which must not be deleted after the fact.
    pub(crate) fn reclaim_node(&self, id: NodeId) -> Result<bool> {
        self.reclaim_storage(id)?;
        let mut meta = self.graph.meta_mut();
        let mut tombstones = self.graph.tombstones_mut();
        let removed = self.graph.remove_node_locked(id, &mut meta).is_some();
        tombstones.remove(&id);
        Ok(removed)
    }

    /// Drop a reclaimed node's vector, code, tombstone and snapshot entry.
    fn reclaim_storage(&self, id: NodeId) -> Result<()> {
        self.cache.remove(id);
        if let Some(compressor) = self.compressor_snapshot() {
            compressor.remove(id);
        }

        let key = id_key(id);
        self.buckets.vectors.delete(&key)?;
        self.buckets.compressed.delete(&key)?;
        self.buckets.graph.delete(&key)?;
        self.buckets.tombstones.delete(&key)?;
        Ok(())
    }

    /// Unlink and reclaim every id tombstoned when the pass starts.
    ///
    /// Ids deleted during the pass are left for the next one. A pass that
    /// fails part way leaves the remaining ids tombstoned, so running it
    /// again picks up where it stopped. Returns the number reclaimed.
    pub fn cleanup_tombstones(&self) -> Result<usize> {
        let _cleanup = self.cleanup_lock.lock();

        let targets: HashSet<NodeId> = self.graph.tombstones().clone();
        if targets.is_empty() {
            return Ok(0);
        }

        self.meter.emit(VizEvent::Hnsw(HnswEvt {
            index: self.name,
            kind: HnswKind::CleanupStart {
                tombstones: targets.len(),
            },
        }));
        tracing::info!(tombstones = targets.len(), "tombstone cleanup started");

        if self.reset_if_all_tombstoned()? {
            self.report_gauges();
            return Ok(targets.len());
        }

        let mut relinked = 0;
        for id in self.graph.ids() {
            if !targets.contains(&id) {
                relinked += self.relink(id, &targets)?;
            }
        }

        // Nothing references the targets any more; the entry point must
        // move before they disappear.
        self.reelect_entry_point_excluding(&targets);

        let mut reclaimed = 0;
        for &id in &targets {
            if self.reclaim_node(id)? {
                reclaimed += 1;
            }
        }

        obs_count!(self.meter, "hnsw_tombstones_cleaned_total", &[], reclaimed);
        self.meter.emit(VizEvent::Hnsw(HnswEvt {
            index: self.name,
            kind: HnswKind::CleanupFinish {
                reclaimed,
                relinked,
            },
        }));
        tracing::info!(reclaimed, relinked, "tombstone cleanup finished");

        self.report_gauges();
        Ok(reclaimed)
    }

    fn reelect_entry_point_excluding(&self, targets: &HashSet<NodeId>) {
        let ep = self.graph.meta().entry_point;
        if ep.map(|ep| targets.contains(&ep)).unwrap_or(false) {
            self.reelect_entry_point();
        }
    }

    /// Remove `targets` from `id`'s neighbor lists and refill the freed
    /// slots with the best candidates found by a local search seeded from
    /// the remaining neighbors and the removed neighbors' own neighbors.
    /// Returns how many layers were repaired.
    fn relink(&self, id: NodeId, targets: &HashSet<NodeId>) -> Result<usize> {
        let Some(node) = self.graph.node(id) else {
            return Ok(0);
        };
        let dirty: Vec<usize> = (0..=node.level)
            .filter(|&layer| {
                node.links[layer]
                    .as_slice()
                    .iter()
                    .any(|n| targets.contains(n))
            })
            .collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let Some(vector) = self.node_vector(id)? else {
            tracing::debug!(id, "node reclaimed during cleanup");
            return Ok(0);
        };

        let compressor = self.compressor_snapshot();
        let space = self.space(compressor.as_deref());
        let distancer = space.distancer(&vector)?;
        let admit = |n: NodeId| n != id && !targets.contains(&n) && !self.graph.is_tombstoned(n);

        for &layer in &dirty {
            let mut seeds: HashSet<NodeId> = HashSet::new();
            for &n in node.links[layer].as_slice() {
                if targets.contains(&n) {
                    for m in self.graph.neighbors(n, layer).unwrap_or_default() {
                        seeds.insert(m);
                    }
                } else {
                    seeds.insert(n);
                }
            }
            seeds.remove(&id);
            seeds.retain(|n| !targets.contains(n));
            if seeds.is_empty() {
                if let Some(ep) = self.graph.meta().entry_point {
                    seeds.insert(ep);
                }
            }

            let entry: Vec<Item> = seeds
                .into_iter()
                .filter_map(|n| distancer.distance_to(n).map(|d| Item::new(n, d)))
                .collect();
            let candidates = self
                .search_layer(&distancer, &entry, self.config.ef_construction, layer, &admit)
                .into_sorted_vec();
            let cap = self.config.max_degree(layer);
            let replacements = self.select_neighbors(&space, &candidates, cap);

            self.graph.with_node_mut(id, |node| {
                if let Some(links) = node.links_at_mut(layer) {
                    let mut kept: Vec<NodeId> = links
                        .as_slice()
                        .iter()
                        .copied()
                        .filter(|n| !targets.contains(n))
                        .collect();
                    for r in &replacements {
                        if kept.len() >= cap {
                            break;
                        }
                        if !kept.contains(r) {
                            kept.push(*r);
                        }
                    }
                    links.replace(kept);
                }
            });
        }

        Ok(dirty.len())
    }
}

#[cfg(test)]
mod tests {
    use crate::{HnswConfig, HnswIndex, MemoryStore};
    use nori_vector::{DistanceFunction, VectorIndex};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn config() -> HnswConfig {
        HnswConfig {
            m: 4,
            m_max0: 8,
            ef_construction: 32,
            seed: Some(3),
            lock_shards: 16,
            ..HnswConfig::new(2, DistanceFunction::Euclidean)
        }
    }

    fn index() -> HnswIndex {
        HnswIndex::in_memory(config()).unwrap()
    }

    fn grid(index: &HnswIndex, n: u64) {
        for i in 0..n {
            index.add(i, &[(i % 10) as f32, (i / 10) as f32]).unwrap();
        }
    }

    #[test]
    fn test_delete_marks_without_unlinking() {
        let index = index();
        grid(&index, 30);

        index.delete(&[5, 6, 999]).unwrap();
        assert!(index.is_tombstoned(5));
        assert!(index.is_tombstoned(6));
        assert!(!index.is_tombstoned(999));
        assert_eq!(index.tombstone_count(), 2);
        assert!(index.contains_node(5));
        assert_eq!(index.len(), 30);
    }

    #[test]
    fn test_entry_point_reelected_on_delete() {
        let index = index();
        grid(&index, 30);

        let ep = index.entry_point().unwrap();
        index.delete(&[ep]).unwrap();

        let new_ep = index.entry_point().unwrap();
        assert_ne!(new_ep, ep);
        assert!(!index.is_tombstoned(new_ep));
    }

    #[test]
    fn test_cleanup_removes_references() {
        let index = index();
        grid(&index, 50);

        let deleted: Vec<u64> = (0..50).filter(|i| i % 3 == 0).collect();
        index.delete(&deleted).unwrap();
        let reclaimed = index.cleanup_tombstones().unwrap();
        assert_eq!(reclaimed, deleted.len());
        assert_eq!(index.tombstone_count(), 0);
        assert_eq!(index.len(), 50 - deleted.len());

        index.graph.for_each_node(|id, node| {
            assert!(!deleted.contains(&id));
            for links in &node.links {
                for n in links.as_slice() {
                    assert!(!deleted.contains(n), "{} still links to {}", id, n);
                }
            }
        });

        // idempotent
        assert_eq!(index.cleanup_tombstones().unwrap(), 0);

        let results = index.search_by_vector(&[4.0, 4.0], 5, None).unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|m| m.id % 3 != 0));
    }

    #[test]
    fn test_deleting_everything_resets() {
        let index = index();
        grid(&index, 10);

        let all: Vec<u64> = (0..10).collect();
        index.delete(&all).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.entry_point(), None);
        assert_eq!(index.tombstone_count(), 0);

        // usable again
        index.add(42, &[1.0, 1.0]).unwrap();
        assert_eq!(index.entry_point(), Some(42));
        let results = index.search_by_vector(&[1.0, 1.0], 3, None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 42);
    }

    #[test]
    fn test_reelection_picks_highest_live_node() {
        let index = Arc::new(index());
        grid(&index, 200);

        let searcher = {
            let index = index.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let q = [(i % 10) as f32 + 0.5, (i / 20) as f32];
                    index.search_by_vector(&q, 5, None).unwrap();
                }
            })
        };

        for _ in 0..20 {
            let ep = index.entry_point().unwrap();
            index.delete(&[ep]).unwrap();

            let new_ep = index.entry_point().unwrap();
            assert!(!index.is_tombstoned(new_ep));
            let (_, best_level) = index.graph.best_live_node().unwrap();
            assert_eq!(index.graph.level_of(new_ep), Some(best_level));
            assert_eq!(index.graph.meta().max_layer, best_level);
        }
        searcher.join().unwrap();
    }

    #[test]
    fn test_reinsert_racing_cleanup_keeps_vector() {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(HnswIndex::new(config(), store.clone()).unwrap());
        grid(&index, 20);
        index.delete(&[7]).unwrap();

        // hold the lock the way a running cleanup pass does
        let pass = index.cleanup_lock.lock();
        let writer = {
            let index = index.clone();
            thread::spawn(move || index.add(7, &[0.5, 0.5]))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(index.reclaim_node(7).unwrap());
        drop(pass);
        writer.join().unwrap().unwrap();

        assert!(index.contains_node(7));
        assert!(!index.is_tombstoned(7));
        assert_eq!(index.load_vector(7).unwrap(), Some(vec![0.5, 0.5]));

        index.flush().unwrap();
        let reopened = HnswIndex::new(config(), store).unwrap();
        reopened.post_startup().unwrap();
        assert!(reopened.contains_node(7));
        let results = reopened.search_by_vector(&[0.5, 0.5], 1, None).unwrap();
        assert_eq!(results[0].id, 7);
    }
}
