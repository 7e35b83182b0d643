// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-size table of lock-protected buckets.
//!
//! A key always lives in the bucket selected by `hash(key) & (N - 1)`. The
//! bucket lock is the only synchronization primitive: callers lock the bucket
//! that owns a key before reading or writing it. The table never grows.

use parking_lot::{Mutex, MutexGuard};
use std::borrow::Borrow;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use crate::config::MAX_BUCKET_COUNT;

/// Stable SipHash of a key, identical for a key and its borrowed form.
pub fn siphash<Q: Hash + ?Sized>(key: &Q) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// One shard: an ordinary map behind its own mutex.
pub struct Bucket<K, V> {
    id: usize,
    elmts: Mutex<HashMap<K, V>>,
}

impl<K: Hash + Eq, V> Bucket<K, V> {
    fn new(id: usize) -> Self {
        Self {
            id,
            elmts: Mutex::new(HashMap::new()),
        }
    }

    /// Index of this bucket inside its table.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Locks the bucket; the lock is released when the guard drops.
    pub fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.elmts.lock()
    }
}

impl<K: Hash + Eq + Debug, V: Debug> Bucket<K, V> {
    /// Logs every element of a non-empty bucket.
    pub fn dump(&self, table: &str) {
        let elmts = self.lock();
        if elmts.is_empty() {
            return;
        }
        tracing::debug!(table, bucket = self.id, len = elmts.len(), "bucket dump");
        for (key, value) in elmts.iter() {
            tracing::debug!(table, bucket = self.id, ?key, ?value, "entry");
        }
    }
}

pub struct ShardedTable<K, V> {
    buckets: Box<[Bucket<K, V>]>,
    mask: usize,
}

impl<K: Hash + Eq, V> ShardedTable<K, V> {
    /// Creates a table with `size` buckets, rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, MAX_BUCKET_COUNT).next_power_of_two();
        let buckets = (0..size).map(Bucket::new).collect::<Vec<_>>();
        Self {
            buckets: buckets.into_boxed_slice(),
            mask: size - 1,
        }
    }

    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Index of the bucket owning `key`.
    pub fn bucket_index<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        (siphash(key) as usize) & self.mask
    }

    /// Bucket owning `key`.
    pub fn bucket_for<Q>(&self, key: &Q) -> &Bucket<K, V>
    where
        K: Borrow<Q>,
        Q: Hash + ?Sized,
    {
        &self.buckets[self.bucket_index(key)]
    }

    /// Bucket by index; wraps around the table size.
    pub fn get_bucket(&self, index: usize) -> &Bucket<K, V> {
        &self.buckets[index & self.mask]
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket<K, V>> {
        self.buckets.iter()
    }

    /// Total number of entries. Locks each bucket in turn, so the result is
    /// not a consistent snapshot under concurrent writers.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Hash + Eq + Debug, V: Debug> ShardedTable<K, V> {
    pub fn dump(&self, table: &str) {
        for bucket in self.buckets.iter() {
            bucket.dump(table);
        }
    }
}
