//! Graph traversal: greedy descent, beam search per layer, re-ranking.

use crate::distancer::Distancer;
use crate::graph::NodeId;
use crate::index::HnswIndex;
use crate::{HnswError, Result};
use nori_vector::{AllowList, Item, Queue, VectorMatch};
use std::collections::HashSet;

/// Initial `k` when a range query has no explicit cap.
const RANGE_SEARCH_BATCH: usize = 100;

/// How many approximate results to keep before exact re-ranking.
pub(crate) fn over_fetch(k: usize, compressed: bool, rescore_limit: usize) -> usize {
    if compressed && rescore_limit > 0 {
        k.max(rescore_limit)
    } else {
        k
    }
}

impl HnswIndex {
    /// Beam search on one layer.
    ///
    /// Every reachable node is traversable; only nodes passing `admit` enter
    /// the result set. Returns a max queue holding at most `ef` results.
    pub(crate) fn search_layer(
        &self,
        distancer: &Distancer<'_>,
        entry: &[Item],
        ef: usize,
        layer: usize,
        admit: &dyn Fn(NodeId) -> bool,
    ) -> Queue {
        let mut visited: HashSet<NodeId> = HashSet::with_capacity(ef * 4);
        let mut candidates = Queue::min(ef);
        let mut results = Queue::max(ef);

        for ep in entry {
            if !visited.insert(ep.id) {
                continue;
            }
            candidates.insert(ep.id, ep.dist);
            if admit(ep.id) {
                results.insert_bounded(ep.id, ep.dist);
            }
        }

        while let Some(current) = candidates.pop() {
            if results.is_full() {
                if let Some(worst) = results.peek_worst() {
                    if current.dist > worst {
                        break;
                    }
                }
            }

            let Some(neighbors) = self.graph.neighbors(current.id, layer) else {
                continue;
            };

            for neighbor in neighbors {
                if !visited.insert(neighbor) {
                    continue;
                }

                let Some(dist) = distancer.distance_to(neighbor) else {
                    tracing::debug!(id = neighbor, layer, "skipping node without vector");
                    continue;
                };

                let improves = !results.is_full()
                    || results.peek_worst().map(|w| dist < w).unwrap_or(true);
                if improves {
                    candidates.insert(neighbor, dist);
                    if admit(neighbor) {
                        results.insert_bounded(neighbor, dist);
                    }
                }
            }
        }

        results
    }

    /// Greedy ef=1 descent through layers `top..bottom` (exclusive).
    pub(crate) fn descend(
        &self,
        distancer: &Distancer<'_>,
        mut entry: Item,
        top: usize,
        bottom: usize,
    ) -> Item {
        for layer in (bottom + 1..=top).rev() {
            let mut best = self.search_layer(distancer, &[entry], 1, layer, &|_| true);
            if let Some(item) = best.pop() {
                entry = item;
            }
        }
        entry
    }

    /// Resolve the current entry point and its distance to the query.
    ///
    /// Retries if cleanup moves the entry point between the snapshot and the
    /// distance lookup.
    pub(crate) fn entry_item(&self, distancer: &Distancer<'_>) -> Result<Option<(Item, usize)>> {
        for _ in 0..3 {
            let meta = self.graph.meta();
            let Some(ep) = meta.entry_point else {
                return Ok(None);
            };
            if let Some(dist) = distancer.distance_to(ep) {
                return Ok(Some((Item::new(ep, dist), meta.max_layer)));
            }
            tracing::debug!(id = ep, "entry point moved during search, retrying");
        }

        Err(HnswError::Invariant(
            "entry point has neither vector nor code".to_string(),
        ))
    }

    /// Recompute exact distances from the durable raw vectors and keep `k`.
    pub(crate) fn rescore(&self, query: &[f32], items: Vec<Item>, k: usize) -> Result<Vec<Item>> {
        let mut rescored = Vec::with_capacity(items.len());
        for item in items {
            match self.load_vector(item.id)? {
                Some(vector) => {
                    rescored.push(Item::new(item.id, self.config.distance.distance(query, &vector)))
                }
                None => tracing::debug!(id = item.id, "skipping rescore of reclaimed node"),
            }
        }
        rescored.sort_by(Item::cmp_closest_first);
        rescored.truncate(k);
        Ok(rescored)
    }

    /// k-NN over the graph (or the flat fallback). `query` is prepared.
    pub(crate) fn knn(
        &self,
        query: &[f32],
        k: usize,
        allow: Option<&dyn AllowList>,
    ) -> Result<Vec<VectorMatch>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let tuning = self.tuning();
        if let Some(allow) = allow {
            if allow.len() < tuning.flat_search_cutoff {
                return self.flat_search(query, k, allow, &tuning);
            }
        }

        let (mut items, compressed) = self.with_space(|space| {
            let distancer = space.distancer(query)?;
            let Some((entry, max_layer)) = self.entry_item(&distancer)? else {
                return Ok((Vec::new(), false));
            };

            let limit = over_fetch(k, space.is_compressed(), tuning.rescore_limit);
            let ef = tuning.ef_for(k).max(limit);

            let entry = self.descend(&distancer, entry, max_layer, 0);
            let admit = |id: NodeId| {
                !self.graph.is_tombstoned(id) && allow.map(|a| a.contains(id)).unwrap_or(true)
            };
            let mut results = self.search_layer(&distancer, &[entry], ef, 0, &admit);
            results.truncate_top(limit);
            Ok((results.into_sorted_vec(), space.is_compressed()))
        })?;

        if compressed && tuning.rescore_limit > 0 {
            items = self.rescore(query, items, k)?;
        } else {
            items.truncate(k);
        }

        Ok(items.into_iter().map(VectorMatch::from).collect())
    }

    /// Every result within `max_distance`, growing `k` until the furthest
    /// result falls outside the radius or the graph is exhausted.
    pub(crate) fn range_search(
        &self,
        query: &[f32],
        max_distance: f32,
        max_limit: Option<usize>,
        allow: Option<&dyn AllowList>,
    ) -> Result<Vec<VectorMatch>> {
        let total = self.graph.len();
        if total == 0 || max_limit == Some(0) {
            return Ok(Vec::new());
        }

        let mut k = max_limit.unwrap_or(RANGE_SEARCH_BATCH).min(total);
        loop {
            let mut results = self.knn(query, k, allow)?;

            let exhausted = results.len() < k || k >= total;
            let outside = results
                .last()
                .map(|m| m.distance > max_distance)
                .unwrap_or(true);
            let capped = max_limit.map(|l| k >= l).unwrap_or(false);

            if exhausted || outside || capped {
                results.retain(|m| m.distance <= max_distance);
                if let Some(limit) = max_limit {
                    results.truncate(limit);
                }
                return Ok(results);
            }

            k = k.saturating_mul(2).min(total);
        }
    }
}
