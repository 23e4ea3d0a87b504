//! Core traits for vector indices.
//!
//! `VectorIndex` is the contract between the query layer and an ANN backend.
//! The in-memory HNSW graph implements it; accelerator-resident backends can
//! implement the same contract.

use crate::allow::AllowList;
use crate::queue::Item;
use tokio_util::sync::CancellationToken;

/// A match returned from vector search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorMatch {
    /// The vector ID.
    pub id: u64,
    /// Distance/score (lower = more similar).
    pub distance: f32,
}

impl VectorMatch {
    /// Create a new vector match.
    pub fn new(id: u64, distance: f32) -> Self {
        Self { id, distance }
    }
}

impl From<Item> for VectorMatch {
    fn from(item: Item) -> Self {
        Self::new(item.id, item.dist)
    }
}

impl Eq for VectorMatch {}

impl PartialOrd for VectorMatch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VectorMatch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Lower distance first, then lower id so equal distances are stable.
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Common interface for ANN vector indices keyed by caller-assigned `u64` ids.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; searches run in parallel with each
/// other and with mutations. Internal synchronization is the responsibility of
/// each implementation.
pub trait VectorIndex: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Insert a vector. Re-inserting an existing id updates it.
    fn add(&self, id: u64, vector: &[f32]) -> Result<(), Self::Error>;

    /// Insert many vectors.
    ///
    /// `cancel` is observed before any mutation; once linking has begun the
    /// batch runs to completion. Failures are reported per item.
    fn add_batch(
        &self,
        cancel: &CancellationToken,
        ids: &[u64],
        vectors: &[Vec<f32>],
    ) -> Result<(), Self::Error>;

    /// Mark ids deleted. Unknown ids are ignored.
    fn delete(&self, ids: &[u64]) -> Result<(), Self::Error>;

    /// The `k` nearest live vectors, ascending by distance.
    fn search_by_vector(
        &self,
        vector: &[f32],
        k: usize,
        allow: Option<&dyn AllowList>,
    ) -> Result<Vec<VectorMatch>, Self::Error>;

    /// Every live vector within `max_distance`, ascending, capped at
    /// `max_limit` when given.
    fn search_by_vector_distance(
        &self,
        vector: &[f32],
        max_distance: f32,
        max_limit: Option<usize>,
        allow: Option<&dyn AllowList>,
    ) -> Result<Vec<VectorMatch>, Self::Error>;

    /// Number of vectors indexed (including ones awaiting cleanup).
    fn already_indexed(&self) -> u64;

    /// Rebuild in-memory state from the durable backing store.
    fn post_startup(&self) -> Result<(), Self::Error>;

    /// Whether distances are currently computed over compressed codes.
    fn compressed(&self) -> bool;

    /// Check dimensions and values without inserting.
    fn validate_before_insert(&self, vector: &[f32]) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_match_ordering() {
        let a = VectorMatch::new(1, 1.0);
        let b = VectorMatch::new(2, 2.0);
        let c = VectorMatch::new(3, 0.5);
        let d = VectorMatch::new(0, 1.0);

        let mut matches = vec![a, b, c, d];
        matches.sort();

        let ids: Vec<u64> = matches.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 0, 1, 2]);
    }

    #[test]
    fn test_from_item() {
        let m: VectorMatch = Item::new(7, 0.25).into();
        assert_eq!(m, VectorMatch::new(7, 0.25));
    }
}
