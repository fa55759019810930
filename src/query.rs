//! Read-oriented binding between a cache key, a fetch function, and a
//! consumer.
//!
//! A `QueryHandle<T>` fetches through the shared [`EntityCache`], so
//! identical concurrent queries collapse into one network call and a fresh
//! cached result is served without fetching at all. The handle is
//! independent of any rendering framework: consumers either call `poll()`
//! from their event loop tick or register a change callback via
//! `subscribe()`.
//!
//! # Example
//!
//! ```ignore
//! let mut products = session.query(
//!   CacheKey::new("products").with_param("category_id", category_id),
//!   move |_key| {
//!     let executor = executor.clone();
//!     async move { executor.execute_as(&RequestSpec::get("products")).await }
//!   },
//! );
//!
//! products.fetch();
//!
//! // In the event loop tick
//! if products.poll() {
//!   // State changed, re-render
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cache::{CacheKey, EntityCache, UNTIL_INVALIDATED};
use crate::error::ApiError;

/// A boxed future that resolves to a fetch outcome
type BoxFetch<T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send>>;

/// A factory that creates fetch futures for the current key
type FetcherFn<T> = Box<dyn Fn(CacheKey) -> BoxFetch<T> + Send + Sync>;

type Listener = Box<dyn Fn() + Send>;

/// Read handle over one cache key.
///
/// Display projection follows stale-while-revalidate: `data()` keeps the
/// last good value during a background refetch, and `is_loading()` is true
/// only before the first success for the current key.
pub struct QueryHandle<T> {
  cache: EntityCache,
  key: CacheKey,
  stale_after: Duration,
  enabled: bool,
  fetcher: FetcherFn<T>,
  data: Option<T>,
  error: Option<ApiError>,
  fetching: bool,
  ever_loaded: bool,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, ApiError>>>,
  listeners: Vec<Listener>,
}

impl<T> QueryHandle<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Create a handle bound to `key` on the shared cache.
  ///
  /// The fetcher is called with the current key each time a network fetch
  /// is actually needed; cache hits never invoke it.
  pub fn new<F, Fut>(cache: EntityCache, key: CacheKey, fetcher: F) -> Self
  where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
  {
    Self {
      cache,
      key,
      stale_after: UNTIL_INVALIDATED,
      enabled: true,
      fetcher: Box::new(move |key| Box::pin(fetcher(key))),
      data: None,
      error: None,
      fetching: false,
      ever_loaded: false,
      receiver: None,
      listeners: Vec::new(),
    }
  }

  /// Set the staleness window. Defaults to "until invalidated", the master
  /// data policy; report queries typically use a short window.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_after = duration;
    self
  }

  /// Start disabled: no fetch happens until `set_enabled(true)`. Used when
  /// a required key parameter is not yet available.
  pub fn disabled(mut self) -> Self {
    self.enabled = false;
    self
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.error.as_ref()
  }

  pub fn is_error(&self) -> bool {
    self.error.is_some()
  }

  /// True only while no data has ever been retrieved for the current key.
  /// Background revalidation of stale data does not count as loading.
  pub fn is_loading(&self) -> bool {
    self.fetching && !self.ever_loaded
  }

  /// True whenever a fetch is in flight, including background revalidation.
  pub fn is_fetching(&self) -> bool {
    self.fetching
  }

  /// Register a change callback, invoked whenever `poll` observes a state
  /// transition.
  pub fn subscribe(&mut self, listener: impl Fn() + Send + 'static) {
    self.listeners.push(Box::new(listener));
  }

  /// Start fetching if enabled and not already in flight.
  ///
  /// Called on mount and on every subscriber access; the cache decides
  /// whether a network call actually happens.
  pub fn fetch(&mut self) {
    if !self.enabled || self.fetching {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch: the handle's own key is invalidated first, so the
  /// cache may not serve the previous result.
  pub fn refetch(&mut self) {
    if !self.enabled {
      return;
    }
    self.cache.invalidate(&self.key);
    self.receiver = None;
    self.start_fetch();
  }

  /// Rebind to a different key (parameters changed). Resets the projection
  /// and fetches the new key immediately when enabled.
  pub fn set_key(&mut self, key: CacheKey) {
    if self.key == key {
      return;
    }
    self.key = key;
    self.data = None;
    self.error = None;
    self.ever_loaded = false;
    self.fetching = false;
    self.receiver = None;
    if self.enabled {
      self.start_fetch();
    }
    self.notify();
  }

  /// Enable or disable fetching. Enabling triggers an immediate fetch.
  pub fn set_enabled(&mut self, enabled: bool) {
    if self.enabled == enabled {
      return;
    }
    self.enabled = enabled;
    if enabled {
      self.start_fetch();
    } else {
      self.receiver = None;
      self.fetching = false;
    }
  }

  /// Poll for the outcome of a pending fetch.
  ///
  /// Returns `true` if the state changed. Call from the event loop tick.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.data = Some(data);
        self.error = None;
        self.ever_loaded = true;
        self.fetching = false;
        self.receiver = None;
        self.notify();
        true
      }
      Ok(Err(error)) => {
        // Keep the last good value; the consumer decides how to surface
        // the error alongside it.
        self.error = Some(error);
        self.fetching = false;
        self.receiver = None;
        self.notify();
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.error = Some(ApiError::Unclassified("Query was cancelled".to_string()));
        self.fetching = false;
        self.receiver = None;
        self.notify();
        true
      }
    }
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.fetching = true;

    let cache = self.cache.clone();
    let key = self.key.clone();
    let stale_after = self.stale_after;
    let future = (self.fetcher)(self.key.clone());
    tokio::spawn(async move {
      let result = cache.fetch(&key, stale_after, move || future).await;
      // Ignore send errors - the handle may have moved on
      let _ = tx.send(result);
    });
  }

  fn notify(&self) {
    for listener in &self.listeners {
      listener();
    }
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for QueryHandle<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryHandle")
      .field("key", &self.key.to_string())
      .field("data", &self.data)
      .field("error", &self.error)
      .field("fetching", &self.fetching)
      .field("enabled", &self.enabled)
      .finish_non_exhaustive()
  }
}
