//! Write-oriented binding: execute a side-effecting request, then invalidate
//! the cache keys declared as dependent.
//!
//! Each mutation declares its invalidation edge up front: the set of key
//! prefixes whose cached results the write makes stale. On success the
//! prefixes are invalidated before the caller's callbacks observe the
//! outcome, so dependent query handles refetch on their next access. On
//! failure nothing is invalidated: the server is assumed not to have
//! committed.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::cache::{CacheKey, EntityCache};
use crate::error::ApiError;

type BoxMutation<O> = Pin<Box<dyn Future<Output = Result<O, ApiError>> + Send>>;

type MutationFn<I, O> = Box<dyn Fn(I) -> BoxMutation<O> + Send + Sync>;

/// Write handle for one mutation kind.
pub struct MutationHandle<I, O> {
  cache: EntityCache,
  mutation: MutationFn<I, O>,
  invalidates: Vec<CacheKey>,
  pending: bool,
  error: Option<ApiError>,
  receiver: Option<mpsc::UnboundedReceiver<Result<O, ApiError>>>,
  on_success: Option<Box<dyn Fn(&O) + Send>>,
  on_error: Option<Box<dyn Fn(&ApiError) + Send>>,
}

impl<I, O> MutationHandle<I, O>
where
  I: Send + 'static,
  O: Send + 'static,
{
  pub fn new<F, Fut>(cache: EntityCache, mutation: F) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, ApiError>> + Send + 'static,
  {
    Self {
      cache,
      mutation: Box::new(move |input| Box::pin(mutation(input))),
      invalidates: Vec::new(),
      pending: false,
      error: None,
      receiver: None,
      on_success: None,
      on_error: None,
    }
  }

  /// Declare a cache key prefix this mutation makes stale on success.
  /// A bare entity type covers every filtered variant of that entity.
  pub fn invalidates(mut self, prefix: CacheKey) -> Self {
    self.invalidates.push(prefix);
    self
  }

  /// Callback invoked by `poll` after a successful mutation, once the
  /// declared invalidations have been applied.
  pub fn on_success(mut self, callback: impl Fn(&O) + Send + 'static) -> Self {
    self.on_success = Some(Box::new(callback));
    self
  }

  /// Callback invoked by `poll` after a failed mutation.
  pub fn on_error(mut self, callback: impl Fn(&ApiError) + Send + 'static) -> Self {
    self.on_error = Some(Box::new(callback));
    self
  }

  pub fn is_pending(&self) -> bool {
    self.pending
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.error.as_ref()
  }

  /// Execute the mutation. A no-op while a previous invocation is pending.
  pub fn mutate(&mut self, input: I) {
    if self.pending {
      return;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.pending = true;
    self.error = None;

    let cache = self.cache.clone();
    let invalidates = self.invalidates.clone();
    let future = (self.mutation)(input);
    tokio::spawn(async move {
      let result = future.await;
      if result.is_ok() {
        for prefix in &invalidates {
          cache.invalidate(prefix);
        }
      }
      let _ = tx.send(result);
    });
  }

  /// Poll for the outcome of a pending mutation.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(output)) => {
        self.pending = false;
        self.receiver = None;
        if let Some(callback) = &self.on_success {
          callback(&output);
        }
        true
      }
      Ok(Err(error)) => {
        self.pending = false;
        self.receiver = None;
        if let Some(callback) = &self.on_error {
          callback(&error);
        }
        self.error = Some(error);
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.pending = false;
        self.receiver = None;
        self.error = Some(ApiError::Unclassified("Mutation was cancelled".to_string()));
        true
      }
    }
  }
}
