//! Linear scan over an explicit id set.
//!
//! O(n * d) but exact, and cheaper than graph traversal when a filter has
//! already narrowed the candidates to a small set.

use crate::queue::{Item, Queue};

/// Scan `ids`, keeping the `limit` closest according to `distance`.
///
/// `distance` returns `Ok(None)` to skip an id (deleted, not materialized)
/// and an error to abort the whole scan. Errors are never swallowed: a
/// silently skipped candidate would bias results.
///
/// Returns items closest first, ties broken by id.
pub fn scan<I, F, E>(ids: I, limit: usize, mut distance: F) -> Result<Vec<Item>, E>
where
    I: IntoIterator<Item = u64>,
    F: FnMut(u64) -> Result<Option<f32>, E>,
{
    let mut results = scan_into_queue(ids, limit, &mut distance)?;
    results.truncate_top(limit);
    Ok(results.into_sorted_vec())
}

/// Like [`scan`] but returns the bounded max queue, for callers that
/// re-rank the survivors before materializing them.
pub fn scan_into_queue<I, F, E>(ids: I, limit: usize, distance: &mut F) -> Result<Queue, E>
where
    I: IntoIterator<Item = u64>,
    F: FnMut(u64) -> Result<Option<f32>, E>,
{
    let mut results = Queue::max(limit);
    if limit == 0 {
        return Ok(results);
    }

    for id in ids {
        if let Some(dist) = distance(id)? {
            results.insert_bounded(id, dist);
        }
    }

    Ok(results)
}
