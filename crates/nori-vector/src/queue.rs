//! Candidate priority queues for graph traversal and re-ranking.
//!
//! A [`Queue`] is a binary heap of `(id, distance)` pairs with one of two
//! roles fixed at construction:
//!
//! - **Min** (`Queue::min`): the top is the *closest* item. Used for the
//!   frontier of unexplored candidates during a layer search.
//! - **Max** (`Queue::max`): the top is the *furthest* item. Used for bounded
//!   result sets, where the worst entry is evicted when a better one arrives.
//!
//! Ties on distance are broken by id so that results are deterministic. The
//! queue performs no deduplication; callers track visited ids themselves.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// An `(id, distance)` pair held by a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Item {
    pub id: u64,
    pub dist: f32,
}

impl Item {
    pub fn new(id: u64, dist: f32) -> Self {
        Self { id, dist }
    }

    /// Ascending distance, then ascending id.
    #[inline]
    pub fn cmp_closest_first(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.id.cmp(&other.id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Min,
    Max,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    item: Item,
    role: Role,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: for the Min role the closest item must
        // compare greatest.
        let natural = self.item.cmp_closest_first(&other.item);
        match self.role {
            Role::Max => natural,
            Role::Min => natural.reverse(),
        }
    }
}

/// Binary-heap priority queue of candidates.
///
/// `insert` and `pop` are O(log n); `top` is O(1).
#[derive(Debug, Clone)]
pub struct Queue {
    heap: BinaryHeap<Entry>,
    role: Role,
    capacity: usize,
}

impl Queue {
    /// Queue whose top is the closest item.
    pub fn min(capacity: usize) -> Self {
        Self::with_role(Role::Min, capacity)
    }

    /// Queue whose top is the furthest item.
    pub fn max(capacity: usize) -> Self {
        Self::with_role(Role::Max, capacity)
    }

    fn with_role(role: Role, capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity.saturating_add(1)),
            role,
            capacity,
        }
    }

    /// Configured capacity, used by [`insert_bounded`](Self::insert_bounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insert(&mut self, id: u64, dist: f32) {
        self.heap.push(Entry {
            item: Item::new(id, dist),
            role: self.role,
        });
    }

    /// Insert into a max queue, keeping at most `capacity` items.
    ///
    /// When full, the item is admitted only if it is strictly closer than the
    /// current worst, which is evicted. Returns whether the item was admitted.
    pub fn insert_bounded(&mut self, id: u64, dist: f32) -> bool {
        debug_assert_eq!(self.role, Role::Max, "bounded insert needs a max queue");
        if self.capacity == 0 {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.insert(id, dist);
            return true;
        }
        let candidate = Item::new(id, dist);
        match self.top() {
            Some(worst) if candidate.cmp_closest_first(&worst) == Ordering::Less => {
                self.heap.pop();
                self.insert(id, dist);
                true
            }
            _ => false,
        }
    }

    /// Remove and return the top item (closest for min, furthest for max).
    pub fn pop(&mut self) -> Option<Item> {
        self.heap.pop().map(|e| e.item)
    }

    /// Peek at the top item without removing it.
    pub fn top(&self) -> Option<Item> {
        self.heap.peek().map(|e| e.item)
    }

    /// Distance of the worst item in a max queue.
    pub fn peek_worst(&self) -> Option<f32> {
        debug_assert_eq!(self.role, Role::Max, "peek_worst needs a max queue");
        self.top().map(|i| i.dist)
    }

    /// Whether a bounded max queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop items until at most `len` remain, evicting from the top.
    pub fn truncate_top(&mut self, len: usize) {
        while self.heap.len() > len {
            self.heap.pop();
        }
    }

    /// Consume the queue, returning items closest first.
    pub fn into_sorted_vec(self) -> Vec<Item> {
        let mut items: Vec<Item> = self.heap.into_iter().map(|e| e.item).collect();
        items.sort_by(Item::cmp_closest_first);
        items
    }
}
