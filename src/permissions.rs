//! Capability checks derived from the cached identity record.

use serde::{Deserialize, Serialize};

use crate::cache::{CacheKey, EntityCache};

/// Identity record returned by the remote API for the signed-in user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
  pub id: u64,
  pub username: String,
  #[serde(default)]
  pub display_name: Option<String>,
  #[serde(default)]
  pub roles: Vec<String>,
  #[serde(default)]
  pub permissions: Vec<String>,
}

/// Cache key under which the identity record lives.
pub fn identity_key() -> CacheKey {
  CacheKey::new("identity")
}

/// True iff the currently cached identity carries `name`.
///
/// Recomputed on every check and never cached independently: its staleness
/// is exactly the identity entry's own staleness. An absent or undecodable
/// identity grants nothing.
pub fn has_permission(cache: &EntityCache, name: &str) -> bool {
  cache
    .get(&identity_key())
    .and_then(|entry| entry.data)
    .and_then(|value| serde_json::from_value::<Identity>(value).ok())
    .map(|identity| identity.permissions.iter().any(|p| p == name))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::UNTIL_INVALIDATED;

  fn sample_identity() -> Identity {
    Identity {
      id: 7,
      username: "clerk".to_string(),
      display_name: None,
      roles: vec!["inventory".to_string()],
      permissions: vec!["products.view".to_string(), "products.edit".to_string()],
    }
  }

  #[tokio::test]
  async fn checks_against_the_cached_identity() {
    let cache = EntityCache::new();
    let identity = sample_identity();
    let _: Identity = cache
      .fetch(&identity_key(), UNTIL_INVALIDATED, move || async move {
        Ok(identity)
      })
      .await
      .unwrap();

    assert!(has_permission(&cache, "products.edit"));
    assert!(!has_permission(&cache, "finance.approve"));
  }

  #[test]
  fn absent_identity_grants_nothing() {
    let cache = EntityCache::new();
    assert!(!has_permission(&cache, "products.view"));
  }
}
