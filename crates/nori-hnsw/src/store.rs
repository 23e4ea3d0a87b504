//! Key-value collaborator used for durability.
//!
//! The index only needs named buckets with put/get/delete and an ordered
//! cursor. Production deployments back this with the LSM engine; tests and
//! embedded users get [`MemoryStore`].

use crate::{HnswError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A named keyspace.
pub trait Bucket: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// A fresh cursor over every entry, ordered by key.
    fn cursor(&self) -> Result<Box<dyn Cursor + '_>>;

    /// Remove every entry.
    fn clear(&self) -> Result<()>;
}

/// Ordered iteration over a bucket. Finite; restart by opening a new cursor.
pub trait Cursor {
    /// Position at the smallest key.
    fn first(&mut self) -> Result<Option<(Bytes, Bytes)>>;

    /// Advance to the next key.
    fn next(&mut self) -> Result<Option<(Bytes, Bytes)>>;
}

/// Store that owns buckets.
pub trait KvStore: Send + Sync {
    fn create_or_load_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>>;
}

/// In-memory store with `BTreeMap` buckets.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, Arc<MemoryBucket>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn create_or_load_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>> {
        if name.is_empty() {
            return Err(HnswError::Store("bucket name cannot be empty".to_string()));
        }

        let bucket: Arc<dyn Bucket> = self
            .buckets
            .write()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(bucket)
    }
}

#[derive(Default)]
struct MemoryBucket {
    entries: RwLock<BTreeMap<Vec<u8>, Bytes>>,
}

impl Bucket for MemoryBucket {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn cursor(&self) -> Result<Box<dyn Cursor + '_>> {
        let cursor: Box<dyn Cursor + '_> = Box::new(MemoryCursor {
            bucket: self,
            last: None,
        });
        Ok(cursor)
    }

    fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}

/// Resumes after the last key seen, so writes during iteration are safe.
struct MemoryCursor<'a> {
    bucket: &'a MemoryBucket,
    last: Option<Vec<u8>>,
}

impl MemoryCursor<'_> {
    fn advance(&mut self) -> Option<(Bytes, Bytes)> {
        use std::ops::Bound;

        let entries = self.bucket.entries.read();
        let lower = match &self.last {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        let (key, value) = entries.range((lower, Bound::Unbounded)).next()?;
        self.last = Some(key.clone());
        Some((Bytes::copy_from_slice(key), value.clone()))
    }
}

impl Cursor for MemoryCursor<'_> {
    fn first(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        self.last = None;
        Ok(self.advance())
    }

    fn next(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        Ok(self.advance())
    }
}
