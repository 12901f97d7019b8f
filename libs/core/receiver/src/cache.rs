//! Bounded LRU caches for message history.
//!
//! [`LruCache`] evicts its oldest entry once capacity is exceeded. "Oldest"
//! follows the cache's [`EvictionOrder`]: with `Insertion` (used by both
//! message caches) only the first insert of a key sets its position; with
//! `Access`, every `get` and `insert` moves the key to the young end.
//! `peek` and `contains` never touch the order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Which operations refresh an entry's position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionOrder {
    #[default]
    Insertion,
    Access,
}

/// Bounded map that evicts its oldest entry.
///
/// Positions live in a queue of `(tick, key)` pairs, oldest at the front.
/// Refreshing or removing a key leaves its old pair behind; a pair is live
/// only while its tick matches the entry's, so eviction pops stale pairs
/// until it reaches a live one.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    capacity: usize,
    order: EvictionOrder,
    entries: HashMap<K, (u64, V)>,
    recency: VecDeque<(u64, K)>,
    tick: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an insertion-ordered cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self::with_order(capacity, EvictionOrder::Insertion)
    }

    pub fn with_order(capacity: usize, order: EvictionOrder) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order,
            entries: HashMap::with_capacity(capacity),
            recency: VecDeque::with_capacity(capacity),
            tick: 0,
        }
    }

    pub fn order(&self) -> EvictionOrder {
        self.order
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn is_live(&self, tick: u64, key: &K) -> bool {
        self.entries.get(key).is_some_and(|(current, _)| *current == tick)
    }

    fn push_position(&mut self, tick: u64, key: K) {
        self.recency.push_back((tick, key));
        if self.recency.len() > self.capacity.saturating_mul(2) {
            let entries = &self.entries;
            self.recency
                .retain(|(tick, key)| entries.get(key).is_some_and(|(current, _)| current == tick));
        }
    }

    fn touch(&mut self, key: &K) {
        if self.order == EvictionOrder::Access && self.entries.contains_key(key) {
            let tick = self.next_tick();
            if let Some(slot) = self.entries.get_mut(key) {
                slot.0 = tick;
            }
            self.push_position(tick, key.clone());
        }
    }

    /// Insert or replace, returning the evicted entry if capacity was exceeded
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.entries.contains_key(&key) {
            self.touch(&key);
            if let Some(slot) = self.entries.get_mut(&key) {
                slot.1 = value;
            }
            return None;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };
        let tick = self.next_tick();
        self.entries.insert(key.clone(), (tick, value));
        self.push_position(tick, key);
        evicted
    }

    /// Get a value, refreshing it in an access-ordered cache
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.touch(key);
        self.entries.get(key).map(|(_, value)| value)
    }

    /// Get a mutable value, refreshing it in an access-ordered cache
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.touch(key);
        self.entries.get_mut(key).map(|(_, value)| value)
    }

    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    /// Keys from oldest to youngest
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.recency
            .iter()
            .filter(|(tick, key)| self.is_live(*tick, key))
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        while let Some((tick, key)) = self.recency.pop_front() {
            if self.is_live(tick, &key) {
                return self.entries.remove(&key).map(|(_, value)| (key, value));
            }
        }
        None
    }
}

/// Processing history of one message id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResultCacheItem {
    /// Number of failed attempts seen for this id
    pub try_count: u32,
    /// First time the message was received
    pub receive_date: DateTime<Utc>,
    pub correlation_id: String,
    /// Last failure reason
    pub comments: Option<String>,
}

/// Try counts per message id
#[derive(Debug)]
pub struct ProcessResultCache {
    inner: LruCache<String, ProcessResultCacheItem>,
}

impl ProcessResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Record a failed attempt and return the updated history
    pub fn record_failure(
        &mut self,
        message_id: &str,
        correlation_id: &str,
        receive_date: DateTime<Utc>,
        comments: impl Into<String>,
    ) -> ProcessResultCacheItem {
        let key = message_id.to_string();
        let comments = comments.into();
        if let Some(item) = self.inner.get_mut(&key) {
            item.try_count = item.try_count.saturating_add(1);
            item.comments = Some(comments);
            return item.clone();
        }
        let item = ProcessResultCacheItem {
            try_count: 1,
            receive_date,
            correlation_id: correlation_id.to_string(),
            comments: Some(comments),
        };
        self.inner.insert(key, item.clone());
        item
    }

    pub fn get(&mut self, message_id: &str) -> Option<ProcessResultCacheItem> {
        self.inner.get(&message_id.to_string()).cloned()
    }

    /// Forget a message after it was processed or quarantined
    pub fn remove(&mut self, message_id: &str) -> Option<ProcessResultCacheItem> {
        self.inner.remove(&message_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Ids that must never be dispatched again
#[derive(Debug)]
pub struct PoisonCache {
    inner: LruCache<String, String>,
}

impl PoisonCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Returns false if the id was already present
    pub fn insert(&mut self, message_id: &str) -> bool {
        let key = message_id.to_string();
        let fresh = !self.inner.contains(&key);
        self.inner.insert(key.clone(), key);
        fresh
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.inner.contains(&message_id.to_string())
    }

    pub fn remove(&mut self, message_id: &str) -> bool {
        self.inner.remove(&message_id.to_string()).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
