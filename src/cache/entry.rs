//! Cache entry states and metadata.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::ApiError;

/// Lifecycle of a cached result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
  /// Created but never fetched
  Idle,
  /// A fetch is in flight and no previous result exists
  Fetching,
  /// Last fetch succeeded within the staleness window
  Fresh,
  /// Past the staleness window or explicitly invalidated; still servable
  /// while a refetch is pending
  Stale,
  /// Last fetch failed
  Errored,
}

/// A single cached result, type-erased to JSON.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub state: EntryState,
  pub data: Option<Value>,
  pub error: Option<ApiError>,
  pub fetched_at: Option<Instant>,
  pub stale_after: Duration,
  /// Bumped by every invalidation; a fetch that started under an older
  /// epoch may not mark the entry Fresh when it lands.
  pub(crate) epoch: u64,
}

impl CacheEntry {
  pub(crate) fn idle(stale_after: Duration) -> Self {
    Self {
      state: EntryState::Idle,
      data: None,
      error: None,
      fetched_at: None,
      stale_after,
      epoch: 0,
    }
  }

  /// Whether the entry can be served without refetching: Fresh and still
  /// inside its staleness window. A Fresh entry past the window is treated
  /// as stale on access even without an explicit invalidation.
  pub fn is_fresh(&self) -> bool {
    self.state == EntryState::Fresh
      && self
        .fetched_at
        .map(|t| t.elapsed() <= self.stale_after)
        .unwrap_or(false)
  }
}
