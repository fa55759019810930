//! Single-flight coordinator for credential renewal.
//!
//! At most one renewal is in flight per credential store. Concurrent
//! callers, no matter which executor they came through, join the existing
//! attempt and all observe the same outcome, so a burst of 401s never
//! hammers the refresh endpoint and a rotated refresh token is exchanged
//! once.

use std::future::Future;
use std::sync::Mutex;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{debug, warn};

use crate::error::ApiError;

type SharedRefresh = Shared<BoxFuture<'static, Result<(), ApiError>>>;

struct Slot {
  current: Option<(u64, SharedRefresh)>,
  next_id: u64,
}

/// Serializes credential renewal: Idle -> Refreshing -> Idle, with the
/// in-flight marker cleared on completion regardless of outcome.
pub struct RefreshCoordinator {
  slot: Mutex<Slot>,
}

impl Default for RefreshCoordinator {
  fn default() -> Self {
    Self::new()
  }
}

impl RefreshCoordinator {
  pub fn new() -> Self {
    Self {
      slot: Mutex::new(Slot {
        current: None,
        next_id: 0,
      }),
    }
  }

  /// Run a renewal, or join the one already in flight.
  ///
  /// `refresh_fn` performs the remote exchange and installs the new pair;
  /// it is invoked only when no renewal is outstanding.
  pub async fn run<F, Fut>(&self, refresh_fn: F) -> Result<(), ApiError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
  {
    let (id, future, started) = {
      let mut slot = self
        .slot
        .lock()
        .map_err(|e| ApiError::Unclassified(format!("Lock poisoned: {}", e)))?;
      if let Some((id, future)) = &slot.current {
        (*id, future.clone(), false)
      } else {
        let id = slot.next_id;
        slot.next_id += 1;
        let future: SharedRefresh = refresh_fn().boxed().shared();
        slot.current = Some((id, future.clone()));
        (id, future, true)
      }
    };

    if started {
      debug!("starting credential refresh");
    } else {
      debug!("joining in-flight credential refresh");
    }

    let result = future.await;

    // Clear the marker even on failure so a later attempt can proceed.
    // The id check keeps a slow awaiter from clearing a successor's marker.
    match self.slot.lock() {
      Ok(mut slot) => {
        if slot
          .current
          .as_ref()
          .map(|(current_id, _)| *current_id == id)
          .unwrap_or(false)
        {
          slot.current = None;
        }
      }
      Err(e) => warn!("Refresh slot lock poisoned: {}", e),
    }

    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  #[tokio::test]
  async fn concurrent_callers_share_one_renewal() {
    let coordinator = Arc::new(RefreshCoordinator::new());
    let calls = Arc::new(AtomicU32::new(0));

    let renewal = |calls: Arc<AtomicU32>| async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      Ok(())
    };

    let (a, b, c) = tokio::join!(
      coordinator.run({
        let calls = calls.clone();
        move || renewal(calls)
      }),
      coordinator.run({
        let calls = calls.clone();
        move || renewal(calls)
      }),
      coordinator.run({
        let calls = calls.clone();
        move || renewal(calls)
      }),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
  }

  #[tokio::test]
  async fn failure_is_shared_and_the_marker_clears() {
    let coordinator = Arc::new(RefreshCoordinator::new());
    let calls = Arc::new(AtomicU32::new(0));

    let failing = |calls: Arc<AtomicU32>| async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      Err(ApiError::Unauthorized)
    };

    let (a, b) = tokio::join!(
      coordinator.run({
        let calls = calls.clone();
        move || failing(calls)
      }),
      coordinator.run({
        let calls = calls.clone();
        move || failing(calls)
      }),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.unwrap_err(), ApiError::Unauthorized);
    assert_eq!(b.unwrap_err(), ApiError::Unauthorized);

    // The failed attempt released the marker; a new attempt runs afresh.
    let result = coordinator
      .run({
        let calls = calls.clone();
        move || async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Ok(())
        }
      })
      .await;
    assert!(result.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
