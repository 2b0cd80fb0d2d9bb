//! Memoized evaluation results with single-flight computation.
//!
//! Each key maps to a slot that is either a finished [`CacheEntry`] or a
//! pending shared future. The map lock is only held while a slot is looked up
//! or replaced, never while a computation runs, so unrelated keys never wait
//! on each other. A caller that drops its future does not cancel the
//! computation for the remaining waiters.

use crate::error::Result;
use crate::registry::FormulaKey;
use crate::schema::{ErrorKind, EvaluationResult};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub entity_id: String,
    pub fiscal_year: i32,
    pub version: String,
    pub formula_key: FormulaKey,
}

impl CacheKey {
    pub fn new(
        entity_id: impl Into<String>,
        fiscal_year: i32,
        version: impl Into<String>,
        formula_key: FormulaKey,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            fiscal_year,
            version: version.into(),
            formula_key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: Arc<EvaluationResult>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers that joined a computation already in flight.
    pub coalesced: u64,
}

type SharedComputation = Shared<BoxFuture<'static, Result<Arc<EvaluationResult>>>>;

enum Slot {
    Ready(CacheEntry),
    Pending {
        computation: SharedComputation,
        generation: u64,
    },
}

#[derive(Default)]
pub struct ResultCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    /// Finished entries kept at most; the oldest are evicted first.
    max_entries: Option<usize>,
    next_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::default()
        }
    }

    /// Returns the cached result for `key`, joins a computation already in
    /// flight, or starts `compute`. Every caller for the same key receives the
    /// same `Arc`. Failed computations are not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        compute: F,
    ) -> Result<Arc<EvaluationResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<EvaluationResult>> + Send + 'static,
    {
        let (computation, generation) = {
            let mut slots = self.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready(entry)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    trace!("Cache hit for {:?}", key);
                    return Ok(Arc::clone(&entry.result));
                }
                Some(Slot::Pending {
                    computation,
                    generation,
                }) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    trace!("Joining in-flight computation for {:?}", key);
                    (computation.clone(), *generation)
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let computation = compute()
                        .map(|outcome| outcome.map(Arc::new))
                        .boxed()
                        .shared();
                    slots.insert(
                        key.clone(),
                        Slot::Pending {
                            computation: computation.clone(),
                            generation,
                        },
                    );
                    (computation, generation)
                }
            }
        };

        let outcome = computation.await;
        self.settle(&key, generation, &outcome);
        outcome
    }

    /// Moves a finished computation into its slot, unless the slot was
    /// invalidated or replaced meanwhile.
    fn settle(&self, key: &CacheKey, generation: u64, outcome: &Result<Arc<EvaluationResult>>) {
        let mut slots = self.slots.lock();
        let still_pending = matches!(
            slots.get(key),
            Some(Slot::Pending { generation: g, .. }) if *g == generation
        );
        if !still_pending {
            return;
        }

        match outcome {
            Ok(result) if !is_cacheable(result) => {
                debug!("Not caching {:?} for {:?}", result.error, key);
                slots.remove(key);
            }
            Ok(result) => {
                slots.insert(
                    key.clone(),
                    Slot::Ready(CacheEntry {
                        key: key.clone(),
                        result: Arc::clone(result),
                        computed_at: Utc::now(),
                    }),
                );
                if let Some(max_entries) = self.max_entries {
                    evict_oldest(&mut slots, max_entries);
                }
            }
            Err(e) => {
                debug!("Not caching failed computation for {:?}: {}", key, e);
                slots.remove(key);
            }
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.slots.lock().get(key) {
            Some(Slot::Ready(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        matches!(self.slots.lock().get(key), Some(Slot::Pending { .. }))
    }

    /// Drops the entry for `key`. A computation still in flight completes for
    /// its waiters but is not stored.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.slots.lock().remove(key).is_some()
    }

    pub fn invalidate_where(&self, mut predicate: impl FnMut(&CacheKey) -> bool) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|key, _| !predicate(key));
        let removed = before - slots.len();
        if removed > 0 {
            debug!("Invalidated {} cache entries", removed);
        }
        removed
    }

    pub fn invalidate_entity(&self, entity_id: &str) -> usize {
        self.invalidate_where(|key| key.entity_id == entity_id)
    }

    /// Drops finished entries computed at or before `now - max_age`.
    /// Computations in flight are kept.
    pub fn evict_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready(entry) => entry.computed_at > cutoff,
            Slot::Pending { .. } => true,
        });
        let removed = before - slots.len();
        if removed > 0 {
            debug!("Evicted {} cache entries older than {}", removed, max_age);
        }
        removed
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }

    /// Number of slots, finished or in flight.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot that is missing now may be uploaded later, so such results
/// are handed to the waiters but never stored.
fn is_cacheable(result: &EvaluationResult) -> bool {
    !matches!(result.error, Some(ErrorKind::MissingLedgerData))
}

fn evict_oldest(slots: &mut HashMap<CacheKey, Slot>, max_entries: usize) {
    let mut finished: Vec<(DateTime<Utc>, CacheKey)> = slots
        .iter()
        .filter_map(|(key, slot)| match slot {
            Slot::Ready(entry) => Some((entry.computed_at, key.clone())),
            Slot::Pending { .. } => None,
        })
        .collect();
    if finished.len() <= max_entries {
        return;
    }

    finished.sort();
    let excess = finished.len() - max_entries;
    for (_, key) in finished.into_iter().take(excess) {
        slots.remove(&key);
    }
    trace!("Evicted {} cache entries over capacity", excess);
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("slots", &self.len())
            .field("max_entries", &self.max_entries)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FormulaEngineError;
    use crate::schema::ResultKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn key(entity: &str, year: i32) -> CacheKey {
        let formula_key = FormulaKey::for_term(&"[10]".parse().unwrap(), ResultKind::Amount);
        CacheKey::new(entity, year, "v1", formula_key)
    }

    fn counted(
        counter: &Arc<AtomicUsize>,
        value: f64,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<EvaluationResult>> {
        let counter = Arc::clone(counter);
        move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(EvaluationResult::valid(value, ResultKind::Amount))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_second_call_is_a_hit() {
        let cache = ResultCache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let first = cache.get_or_compute(key("a", 2023), counted(&counter, 1.0)).await.unwrap();
        let second = cache.get_or_compute(key("a", 2023), counted(&counter, 2.0)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.value, 1.0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
        assert!(cache.get(&key("a", 2023)).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = ResultCache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (first, second) = tokio::join!(
            cache.get_or_compute(key("a", 2023), counted(&counter, 1.0)),
            cache.get_or_compute(key("a", 2023), counted(&counter, 2.0)),
        );

        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().coalesced, 1);
    }

    #[tokio::test]
    async fn test_unrelated_keys_compute_independently() {
        let cache = ResultCache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let (a, b) = tokio::join!(
            cache.get_or_compute(key("a", 2023), counted(&counter, 1.0)),
            cache.get_or_compute(key("b", 2023), counted(&counter, 2.0)),
        );

        assert_eq!(a.unwrap().value, 1.0);
        assert_eq!(b.unwrap().value, 2.0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = ResultCache::new();
        let error = cache
            .get_or_compute(key("a", 2023), || async {
                Err::<EvaluationResult, _>(FormulaEngineError::LedgerUnavailable {
                    entity_id: "a".to_string(),
                    fiscal_year: 2023,
                    details: "timeout".to_string(),
                })
            })
            .await;
        assert!(error.is_err());
        assert!(cache.is_empty());

        let counter = Arc::new(AtomicUsize::new(0));
        let retried = cache.get_or_compute(key("a", 2023), counted(&counter, 3.0)).await;
        assert_eq!(retried.unwrap().value, 3.0);
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_other_waiters() {
        let cache = Arc::new(ResultCache::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let abandoned = {
            let cache = Arc::clone(&cache);
            let compute = counted(&counter, 7.0);
            tokio::spawn(async move { cache.get_or_compute(key("a", 2023), compute).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.is_pending(&key("a", 2023)));

        let waiter = {
            let cache = Arc::clone(&cache);
            let compute = counted(&counter, 8.0);
            tokio::spawn(async move { cache.get_or_compute(key("a", 2023), compute).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        abandoned.abort();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.value, 7.0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(cache.get(&key("a", 2023)).is_some());
    }

    #[tokio::test]
    async fn test_invalidation_while_pending_discards_result() {
        let cache = ResultCache::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let pending = cache.get_or_compute(key("a", 2023), counted(&counter, 1.0));
        let invalidate = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(cache.invalidate(&key("a", 2023)));
        };
        let (result, _) = tokio::join!(pending, invalidate);

        assert_eq!(result.unwrap().value, 1.0);
        assert!(cache.get(&key("a", 2023)).is_none());
    }

    #[tokio::test]
    async fn test_invalidate_entity() {
        let cache = ResultCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for (entity, year) in [("a", 2022), ("a", 2023), ("b", 2023)] {
            cache
                .get_or_compute(key(entity, year), counted(&counter, 1.0))
                .await
                .unwrap();
        }

        assert_eq!(cache.invalidate_entity("a"), 2);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_missing_ledger_data_is_not_stored() {
        let cache = ResultCache::new();
        let missing = cache
            .get_or_compute(key("a", 2023), || async {
                Ok(EvaluationResult::invalid(
                    ErrorKind::MissingLedgerData,
                    ResultKind::Amount,
                ))
            })
            .await
            .unwrap();
        assert_eq!(missing.error, Some(ErrorKind::MissingLedgerData));
        assert!(cache.is_empty());

        // other invalid results are stable for the snapshot and stay cached
        cache
            .get_or_compute(key("b", 2023), || async {
                Ok(EvaluationResult::invalid(
                    ErrorKind::DivisionByZero,
                    ResultKind::Amount,
                ))
            })
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);

        let counter = Arc::new(AtomicUsize::new(0));
        let uploaded = cache.get_or_compute(key("a", 2023), counted(&counter, 4.0)).await;
        assert_eq!(uploaded.unwrap().value, 4.0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_entries() {
        let cache = ResultCache::with_max_entries(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for year in [2021, 2022, 2023] {
            cache
                .get_or_compute(key("a", year), counted(&counter, f64::from(year)))
                .await
                .unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a", 2021)).is_none());
        assert!(cache.get(&key("a", 2022)).is_some());
        assert!(cache.get(&key("a", 2023)).is_some());
    }

    #[tokio::test]
    async fn test_evict_older_than() {
        let cache = ResultCache::new();
        let counter = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_compute(key("a", 2023), counted(&counter, 1.0))
            .await
            .unwrap();

        assert_eq!(cache.evict_older_than(chrono::Duration::hours(1)), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict_older_than(chrono::Duration::zero()), 1);
        assert!(cache.is_empty());
    }
}
