//! # Bucket Store Adapter
//!
//! The rollup engine only needs three primitives from its store: an atomic
//! per-member increment, a summing union of several sets into one destination,
//! and a scored range read. Everything else about the store is opaque.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::CounterError;

/// Ordered-set store used by the rollup engine.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Atomically adds `delta` to the score of `member` in `set_key` and
    /// returns the new score.
    async fn increment_member(&self, set_key: &str, member: &str, delta: i64) -> Result<i64, CounterError>;

    /// Replaces `dest_key` with the union of `source_keys`, summing scores per
    /// member. Missing sources contribute nothing.
    async fn merge_sum(&self, dest_key: &str, source_keys: &[String]) -> Result<(), CounterError>;

    /// Returns every member of `key` with its score, ordered by score then
    /// member.
    async fn range_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, CounterError>;
}

/// # Memory Bucket Store
///
/// Sorted sets held in process memory. `set_available(false)` makes every
/// call fail with `StoreUnavailable`, which is how tests exercise the requeue
/// path.
#[derive(Debug)]
pub struct MemoryBucketStore {
    sets: Mutex<HashMap<String, BTreeMap<String, i64>>>,
    available: AtomicBool,
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBucketStore {
    /// Creates an empty, available store.
    pub fn new() -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggles simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of non-empty sets currently held.
    pub fn len(&self) -> usize {
        self.sets.lock().expect("Bucket store lock poisoned").len()
    }

    /// True when no set holds a member.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), CounterError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CounterError::StoreUnavailable("memory store switched off".to_string()))
        }
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn increment_member(&self, set_key: &str, member: &str, delta: i64) -> Result<i64, CounterError> {
        self.check()?;
        let mut sets = self.sets.lock().expect("Bucket store lock poisoned");
        let score = sets
            .entry(set_key.to_string())
            .or_default()
            .entry(member.to_string())
            .or_insert(0);
        *score += delta;
        Ok(*score)
    }

    async fn merge_sum(&self, dest_key: &str, source_keys: &[String]) -> Result<(), CounterError> {
        self.check()?;
        let mut sets = self.sets.lock().expect("Bucket store lock poisoned");

        let mut merged: BTreeMap<String, i64> = BTreeMap::new();
        for key in source_keys {
            if let Some(set) = sets.get(key) {
                for (member, score) in set {
                    *merged.entry(member.clone()).or_insert(0) += score;
                }
            }
        }

        // Like ZUNIONSTORE, an empty union leaves no destination behind.
        if merged.is_empty() {
            sets.remove(dest_key);
        } else {
            sets.insert(dest_key.to_string(), merged);
        }
        Ok(())
    }

    async fn range_with_scores(&self, key: &str) -> Result<Vec<(String, i64)>, CounterError> {
        self.check()?;
        let sets = self.sets.lock().expect("Bucket store lock poisoned");
        let mut members: Vec<(String, i64)> = sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_returns_running_score() {
        let store = MemoryBucketStore::new();
        assert_eq!(store.increment_member("b", "login", 1).await.unwrap(), 1);
        assert_eq!(store.increment_member("b", "login", 4).await.unwrap(), 5);
        assert_eq!(store.increment_member("b", "login", -2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_merge_sum_overwrites_destination() {
        let store = MemoryBucketStore::new();
        store.increment_member("a", "x", 2).await.unwrap();
        store.increment_member("b", "x", 3).await.unwrap();
        store.increment_member("b", "y", 1).await.unwrap();
        store.increment_member("dest", "stale", 99).await.unwrap();

        let sources = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        store.merge_sum("dest", &sources).await.unwrap();
        store.merge_sum("dest", &sources).await.unwrap();

        let range = store.range_with_scores("dest").await.unwrap();
        assert_eq!(range, vec![("y".to_string(), 1), ("x".to_string(), 5)]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryBucketStore::new();
        store.set_available(false);

        assert!(matches!(
            store.increment_member("a", "x", 1).await,
            Err(CounterError::StoreUnavailable(_))
        ));
        assert!(matches!(store.merge_sum("d", &[]).await, Err(CounterError::StoreUnavailable(_))));
        assert!(matches!(store.range_with_scores("a").await, Err(CounterError::StoreUnavailable(_))));
        assert!(store.is_empty());
    }
}
