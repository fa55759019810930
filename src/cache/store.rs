//! The entity cache: keyed results with single-flight fetching and
//! prefix-based invalidation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::entry::{CacheEntry, EntryState};
use super::key::CacheKey;
use crate::error::ApiError;

/// Staleness window for master data: fresh until a mutation invalidates it.
pub const UNTIL_INVALIDATED: Duration = Duration::MAX;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, ApiError>>>;

struct InflightFetch {
  id: u64,
  future: SharedFetch,
}

struct Inner {
  entries: HashMap<CacheKey, CacheEntry>,
  inflight: HashMap<CacheKey, InflightFetch>,
  /// Bumped on evict_all; results from fetches started under an older
  /// generation are discarded entirely.
  generation: u64,
  next_fetch_id: u64,
}

/// Process-wide cache of fetched results, keyed by [`CacheKey`].
///
/// Cheap to clone; all clones share one store. Within one key, fetches are
/// serialized by deduplication: concurrent identical fetches share a single
/// underlying execution and observe the same outcome.
#[derive(Clone)]
pub struct EntityCache {
  inner: Arc<Mutex<Inner>>,
}

impl Default for EntityCache {
  fn default() -> Self {
    Self::new()
  }
}

impl EntityCache {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        entries: HashMap::new(),
        inflight: HashMap::new(),
        generation: 0,
        next_fetch_id: 0,
      })),
    }
  }

  /// Snapshot of the entry for a key, if one exists.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.inner.lock().ok()?.entries.get(key).cloned()
  }

  /// Fetch a value through the cache.
  ///
  /// A Fresh entry inside its staleness window is returned without invoking
  /// `fetcher`. An identical fetch already in flight is joined rather than
  /// reissued. Otherwise `fetcher` runs once, and the entry records the
  /// outcome as Fresh or Errored.
  pub async fn fetch<T, F, Fut>(
    &self,
    key: &CacheKey,
    stale_after: Duration,
    fetcher: F,
  ) -> Result<T, ApiError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    let future = {
      let mut inner = self
        .inner
        .lock()
        .map_err(|e| ApiError::Unclassified(format!("Lock poisoned: {}", e)))?;

      if let Some(entry) = inner.entries.get(key) {
        if entry.is_fresh() {
          if let Some(value) = entry.data.clone() {
            return decode(value);
          }
        }
      }

      if let Some(inflight) = inner.inflight.get(key) {
        inflight.future.clone()
      } else {
        let entry = inner
          .entries
          .entry(key.clone())
          .or_insert_with(|| CacheEntry::idle(stale_after));
        entry.stale_after = stale_after;
        if entry.data.is_none() {
          entry.state = EntryState::Fetching;
        }
        let started_epoch = entry.epoch;
        let started_generation = inner.generation;
        let fetch_id = inner.next_fetch_id;
        inner.next_fetch_id += 1;

        let cache = self.clone();
        let owned_key = key.clone();
        let fetch = fetcher();
        let future: SharedFetch = async move {
          let result = match fetch.await {
            Ok(data) => serde_json::to_value(&data)
              .map_err(|e| ApiError::Unclassified(format!("Failed to encode cached value: {}", e))),
            Err(e) => Err(e),
          };
          cache.complete(&owned_key, fetch_id, started_generation, started_epoch, &result);
          result
        }
        .boxed()
        .shared();

        inner.inflight.insert(
          key.clone(),
          InflightFetch {
            id: fetch_id,
            future: future.clone(),
          },
        );
        future
      }
    };

    decode(future.await?)
  }

  /// Record the outcome of a fetch. Runs exactly once per underlying fetch,
  /// inside the shared future, no matter how many callers joined it.
  fn complete(
    &self,
    key: &CacheKey,
    fetch_id: u64,
    started_generation: u64,
    started_epoch: u64,
    result: &Result<Value, ApiError>,
  ) {
    let mut inner = match self.inner.lock() {
      Ok(inner) => inner,
      Err(e) => {
        warn!(key = %key, "Cache lock poisoned, dropping fetch result: {}", e);
        return;
      }
    };

    // Never remove an in-flight marker that belongs to a newer fetch.
    let owns_marker = inner
      .inflight
      .get(key)
      .map(|inflight| inflight.id == fetch_id)
      .unwrap_or(false);
    if owns_marker {
      inner.inflight.remove(key);
    }

    if inner.generation != started_generation {
      // The cache was evicted (sign-out) while this fetch was in flight.
      debug!(key = %key, "discarding fetch result from evicted cache generation");
      return;
    }

    let entry = match inner.entries.get_mut(key) {
      Some(entry) => entry,
      None => return,
    };

    match result {
      Ok(value) => {
        entry.data = Some(value.clone());
        entry.error = None;
        entry.fetched_at = Some(Instant::now());
        // An invalidation that landed while this fetch was in flight bumped
        // the epoch; the data is kept but may not be presented as Fresh.
        entry.state = if entry.epoch == started_epoch {
          EntryState::Fresh
        } else {
          EntryState::Stale
        };
      }
      Err(e) => {
        entry.state = EntryState::Errored;
        entry.error = Some(e.clone());
      }
    }
  }

  /// Mark every entry covered by `prefix` as Stale.
  ///
  /// Does not force a refetch; stale entries refetch on next access.
  pub fn invalidate(&self, prefix: &CacheKey) {
    let mut inner = match self.inner.lock() {
      Ok(inner) => inner,
      Err(e) => {
        warn!(prefix = %prefix, "Cache lock poisoned, skipping invalidation: {}", e);
        return;
      }
    };
    let mut marked = 0usize;
    for (key, entry) in inner.entries.iter_mut() {
      if key.starts_with(prefix) {
        entry.epoch += 1;
        if matches!(entry.state, EntryState::Fresh | EntryState::Errored) {
          entry.state = EntryState::Stale;
        }
        marked += 1;
      }
    }
    debug!(prefix = %prefix, marked, "invalidated cache entries");
  }

  /// Drop every entry. Used on sign-out; results of fetches still in flight
  /// are discarded when they land.
  pub fn evict_all(&self) {
    let mut inner = match self.inner.lock() {
      Ok(inner) => inner,
      Err(e) => {
        warn!("Cache lock poisoned during eviction: {}", e);
        return;
      }
    };
    inner.generation += 1;
    inner.entries.clear();
    inner.inflight.clear();
  }

  #[cfg(test)]
  fn state_of(&self, key: &CacheKey) -> Option<EntryState> {
    self.get(key).map(|entry| entry.state)
  }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
  serde_json::from_value(value)
    .map_err(|e| ApiError::Unclassified(format!("Failed to decode cached value: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn counting_fetcher(
    counter: &Arc<AtomicU32>,
    value: Vec<String>,
  ) -> impl Future<Output = Result<Vec<String>, ApiError>> + Send + 'static {
    let counter = counter.clone();
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      Ok(value)
    }
  }

  #[tokio::test]
  async fn concurrent_fetches_share_one_execution() {
    let cache = EntityCache::new();
    let key = CacheKey::new("warehouses");
    let counter = Arc::new(AtomicU32::new(0));

    let warehouses = vec!["main".to_string(), "north".to_string()];
    let (a, b): (Result<Vec<String>, _>, Result<Vec<String>, _>) = tokio::join!(
      cache.fetch(&key, UNTIL_INVALIDATED, || counting_fetcher(
        &counter,
        warehouses.clone()
      )),
      cache.fetch(&key, UNTIL_INVALIDATED, || counting_fetcher(
        &counter,
        warehouses.clone()
      )),
    );

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap(), warehouses);
    assert_eq!(b.unwrap(), warehouses);
    assert_eq!(cache.state_of(&key), Some(EntryState::Fresh));
  }

  #[tokio::test]
  async fn fresh_entry_is_served_without_refetching() {
    let cache = EntityCache::new();
    let key = CacheKey::new("brands");
    let counter = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
      let result: Vec<String> = cache
        .fetch(&key, UNTIL_INVALIDATED, || {
          counting_fetcher(&counter, vec!["acme".to_string()])
        })
        .await
        .unwrap();
      assert_eq!(result, vec!["acme".to_string()]);
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn entry_past_its_window_refetches_on_access() {
    let cache = EntityCache::new();
    let key = CacheKey::new("stock_report");
    let counter = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
      let _: Vec<String> = cache
        .fetch(&key, Duration::ZERO, || counting_fetcher(&counter, vec![]))
        .await
        .unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn prefix_invalidation_marks_matching_entries_stale() {
    let cache = EntityCache::new();
    let counter = Arc::new(AtomicU32::new(0));

    let all_products = CacheKey::new("products");
    let by_brand = CacheKey::new("products").with_param("brand_id", "b1");
    let warehouses = CacheKey::new("warehouses");

    for key in [&all_products, &by_brand, &warehouses] {
      let _: Vec<String> = cache
        .fetch(key, UNTIL_INVALIDATED, || counting_fetcher(&counter, vec![]))
        .await
        .unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    cache.invalidate(&CacheKey::new("products"));

    assert_eq!(cache.state_of(&all_products), Some(EntryState::Stale));
    assert_eq!(cache.state_of(&by_brand), Some(EntryState::Stale));
    assert_eq!(cache.state_of(&warehouses), Some(EntryState::Fresh));

    // A stale entry issues exactly one refetch on next access.
    let _: Vec<String> = cache
      .fetch(&by_brand, UNTIL_INVALIDATED, || {
        counting_fetcher(&counter, vec![])
      })
      .await
      .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 4);
    assert_eq!(cache.state_of(&by_brand), Some(EntryState::Fresh));
  }

  #[tokio::test]
  async fn concurrent_callers_observe_the_same_failure() {
    let cache = EntityCache::new();
    let key = CacheKey::new("products");
    let counter = Arc::new(AtomicU32::new(0));

    let failing = |counter: Arc<AtomicU32>| async move {
      counter.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      Err::<Vec<String>, _>(ApiError::Unclassified("backend unavailable".to_string()))
    };

    let (a, b): (Result<Vec<String>, _>, Result<Vec<String>, _>) = tokio::join!(
      cache.fetch(&key, UNTIL_INVALIDATED, {
        let counter = counter.clone();
        move || failing(counter)
      }),
      cache.fetch(&key, UNTIL_INVALIDATED, {
        let counter = counter.clone();
        move || failing(counter)
      }),
    );

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap_err(), b.unwrap_err());
    assert_eq!(cache.state_of(&key), Some(EntryState::Errored));
  }

  #[tokio::test]
  async fn invalidation_during_flight_lands_the_result_as_stale() {
    let cache = EntityCache::new();
    let key = CacheKey::new("products");

    let fetch = {
      let cache = cache.clone();
      let key = key.clone();
      tokio::spawn(async move {
        cache
          .fetch(&key, UNTIL_INVALIDATED, || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, ApiError>(vec!["widget".to_string()])
          })
          .await
      })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    cache.invalidate(&CacheKey::new("products"));

    let result = fetch.await.unwrap().unwrap();
    assert_eq!(result, vec!["widget".to_string()]);

    // Data is kept for stale-while-revalidate display, but may not be
    // presented as Fresh: the fetch predates the invalidation.
    let entry = cache.get(&key).unwrap();
    assert_eq!(entry.state, EntryState::Stale);
    assert!(entry.data.is_some());
  }

  #[tokio::test]
  async fn evict_all_clears_every_entry() {
    let cache = EntityCache::new();
    let counter = Arc::new(AtomicU32::new(0));
    let keys = [
      CacheKey::new("products"),
      CacheKey::new("identity"),
      CacheKey::new("sales_report").with_param("month", "2026-08"),
    ];

    for key in &keys {
      let _: Vec<String> = cache
        .fetch(key, UNTIL_INVALIDATED, || counting_fetcher(&counter, vec![]))
        .await
        .unwrap();
    }

    cache.evict_all();

    for key in &keys {
      assert!(cache.get(key).is_none());
    }
  }

  #[tokio::test]
  async fn eviction_during_flight_discards_the_result() {
    let cache = EntityCache::new();
    let key = CacheKey::new("products");

    let fetch = {
      let cache = cache.clone();
      let key = key.clone();
      tokio::spawn(async move {
        cache
          .fetch(&key, UNTIL_INVALIDATED, || async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, ApiError>(vec!["widget".to_string()])
          })
          .await
      })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    cache.evict_all();

    // The caller still gets its value; the cache just stops remembering it.
    assert!(fetch.await.unwrap().is_ok());
    assert!(cache.get(&key).is_none());
  }

  #[tokio::test]
  async fn a_poisoned_lock_degrades_instead_of_panicking() {
    let cache = EntityCache::new();
    let key = CacheKey::new("products");

    let poisoner = cache.clone();
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
      let _guard = poisoner.inner.lock().unwrap();
      panic!("poisoning the cache lock");
    }));

    assert!(cache.get(&key).is_none());
    cache.invalidate(&key);
    cache.evict_all();

    let result: Result<Vec<String>, _> = cache
      .fetch(&key, UNTIL_INVALIDATED, || async { Ok(vec![]) })
      .await;
    assert!(result.is_err());
  }
}
