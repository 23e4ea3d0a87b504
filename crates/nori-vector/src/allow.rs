//! Allow-lists: query-scoped sets of ids a search may return.
//!
//! An allow-list is supplied by the caller (typically the result of a
//! metadata pre-filter), is read-only, and lives only for one query.

use std::collections::{BTreeSet, HashSet};

/// A read-only set of currently valid ids.
pub trait AllowList: Send + Sync {
    /// Membership check used while traversing the graph.
    fn contains(&self, id: u64) -> bool;

    /// Cardinality, used to decide between graph search and a linear scan.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fresh iterator over every id. Restarting means asking again.
    fn iter(&self) -> Box<dyn Iterator<Item = u64> + '_>;
}

impl AllowList for HashSet<u64> {
    fn contains(&self, id: u64) -> bool {
        HashSet::contains(self, &id)
    }

    fn len(&self) -> usize {
        HashSet::len(self)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = u64> + '_> {
        Box::new(HashSet::iter(self).copied())
    }
}

impl AllowList for BTreeSet<u64> {
    fn contains(&self, id: u64) -> bool {
        BTreeSet::contains(self, &id)
    }

    fn len(&self) -> usize {
        BTreeSet::len(self)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = u64> + '_> {
        Box::new(BTreeSet::iter(self).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(allow: &dyn AllowList) {
        assert_eq!(allow.len(), 3);
        assert!(allow.contains(2));
        assert!(!allow.contains(4));

        let mut ids: Vec<u64> = allow.iter().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);

        // A second iterator starts over
        assert_eq!(allow.iter().count(), 3);
    }

    #[test]
    fn test_set_impls() {
        let hs: HashSet<u64> = [1, 2, 3].into_iter().collect();
        let bs: BTreeSet<u64> = [3, 1, 2].into_iter().collect();
        check(&hs);
        check(&bs);
        assert!(!AllowList::is_empty(&bs));
        assert!(AllowList::is_empty(&BTreeSet::<u64>::new()));
    }
}
