//! Linear scan over an allow-list.
//!
//! Used when the allow-list is smaller than `flat_search_cutoff`: a filter
//! that narrow makes graph traversal over the filtered subgraph both slower
//! and prone to under-connectivity.

use crate::config::SearchTuning;
use crate::index::HnswIndex;
use crate::search::over_fetch;
use crate::{HnswError, Result};
use nori_observe::{obs_count, HnswEvt, HnswKind, VizEvent};
use nori_vector::{scan_into_queue, AllowList, VectorMatch};

impl HnswIndex {
    pub(crate) fn flat_search(
        &self,
        query: &[f32],
        k: usize,
        allow: &dyn AllowList,
        tuning: &SearchTuning,
    ) -> Result<Vec<VectorMatch>> {
        obs_count!(self.meter, "hnsw_flat_searches_total", &[], 1);
        self.meter.emit(VizEvent::Hnsw(HnswEvt {
            index: self.name,
            kind: HnswKind::FlatSearch {
                candidates: allow.len(),
            },
        }));

        let (mut items, compressed) = self.with_space(|space| {
            let limit = over_fetch(k, space.is_compressed(), tuning.rescore_limit);
            let distancer = space.distancer(query)?;
            let tombstones = self.graph.tombstones();
            let mut distance = |id: u64| -> std::result::Result<Option<f32>, HnswError> {
                if tombstones.contains(&id) {
                    return Ok(None);
                }
                if !self.graph.contains(id) {
                    tracing::debug!(id, action = "flat_search", "allowed id not in graph");
                    return Ok(None);
                }
                Ok(distancer.distance_to(id))
            };
            let mut results = scan_into_queue(allow.iter(), limit, &mut distance)?;
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
}
