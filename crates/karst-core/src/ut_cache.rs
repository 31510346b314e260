//! Unconfirmed-transactions cache.
//!
//! A bounded holding area for transactions awaiting inclusion in a block.
//! Replacement policy is intentionally simple (reject when full); the
//! interesting consumers are membership checks from the known-hash
//! predicate and candidate selection from the harvester.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::element::TransactionInfo;
use crate::error::UtCacheError;
use crate::types::Hash256;

/// Default capacity of the unconfirmed-transactions cache.
pub const DEFAULT_UT_CACHE_CAPACITY: usize = 10_000;

/// Thread-safe cache of unconfirmed transactions keyed by entity hash.
pub struct UtCache {
    inner: Mutex<UtCacheInner>,
}

struct UtCacheInner {
    transactions: HashMap<Hash256, TransactionInfo>,
    /// Insertion order, used to keep candidate selection deterministic.
    order: Vec<Hash256>,
    capacity: usize,
}

impl UtCache {
    /// Create a cache with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_UT_CACHE_CAPACITY)
    }

    /// Create a cache holding at most `capacity` transactions.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(UtCacheInner {
                transactions: HashMap::new(),
                order: Vec::new(),
                capacity,
            }),
        }
    }

    /// Insert a transaction. Fails on duplicates and when full.
    pub fn insert(&self, info: TransactionInfo) -> Result<(), UtCacheError> {
        let mut inner = self.inner.lock();
        if inner.transactions.contains_key(&info.entity_hash) {
            return Err(UtCacheError::AlreadyExists(info.entity_hash));
        }
        if inner.transactions.len() >= inner.capacity {
            return Err(UtCacheError::CacheFull);
        }
        inner.order.push(info.entity_hash);
        inner.transactions.insert(info.entity_hash, info);
        Ok(())
    }

    /// Whether the cache holds a transaction with this entity hash.
    pub fn contains(&self, hash: &Hash256) -> bool {
        self.inner.lock().transactions.contains_key(hash)
    }

    /// Remove and return a transaction by entity hash.
    pub fn remove(&self, hash: &Hash256) -> Option<TransactionInfo> {
        let mut inner = self.inner.lock();
        let removed = inner.transactions.remove(hash);
        if removed.is_some() {
            inner.order.retain(|h| h != hash);
        }
        removed
    }

    /// Drop every transaction confirmed by a committed block.
    pub fn remove_confirmed(&self, hashes: &[Hash256]) {
        let mut inner = self.inner.lock();
        let UtCacheInner { transactions, order, .. } = &mut *inner;
        for hash in hashes {
            transactions.remove(hash);
        }
        order.retain(|h| transactions.contains_key(h));
    }

    /// Up to `max` candidate transactions in insertion order.
    pub fn candidates(&self, max: usize) -> Vec<TransactionInfo> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|h| inner.transactions.get(h).cloned())
            .take(max)
            .collect()
    }

    /// Number of cached transactions.
    pub fn len(&self) -> usize {
        self.inner.lock().transactions.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for UtCache {
    fn default() -> Self {
        Self::new()
    }
}
