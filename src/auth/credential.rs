//! In-memory credential store, mirrored to the durable vault.
//!
//! The in-memory pair is authoritative for the session; vault writes are
//! fire-and-forget and never block callers on persistence I/O.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::refresh::RefreshCoordinator;
use crate::vault::{CredentialVault, PersistedCredential};

/// Access/refresh token pair authorizing requests to the remote API.
#[derive(Debug, Clone)]
pub struct Credential {
  pub access_token: String,
  pub refresh_token: Option<String>,
  /// Decoded from the access token's `exp` claim; None when undecodable.
  pub expires_at: Option<DateTime<Utc>>,
}

/// Holds the current credential pair. At most one pair is live per session;
/// replacing it invalidates the previous one immediately. The store also
/// owns the refresh coordinator, so renewal is serialized across every
/// executor sharing the store, not per executor.
pub struct CredentialStore {
  current: Mutex<Option<Credential>>,
  vault: Arc<dyn CredentialVault>,
  refresh: RefreshCoordinator,
}

impl CredentialStore {
  pub fn new(vault: Arc<dyn CredentialVault>) -> Self {
    Self {
      current: Mutex::new(None),
      vault,
      refresh: RefreshCoordinator::new(),
    }
  }

  /// Coordinator serializing renewals of this store's pair.
  pub fn refresh_coordinator(&self) -> &RefreshCoordinator {
    &self.refresh
  }

  /// Replace the credential pair and mirror it to the vault.
  ///
  /// The vault write runs on the blocking pool and its failure is logged
  /// and ignored; in-memory state remains authoritative.
  pub fn set(&self, access_token: impl Into<String>, refresh_token: Option<String>) {
    let access_token = access_token.into();
    let expires_at = decode_expiry(&access_token);
    debug!(token = %fingerprint(&access_token), "installing new access credential");

    match self.current.lock() {
      Ok(mut current) => {
        *current = Some(Credential {
          access_token: access_token.clone(),
          refresh_token: refresh_token.clone(),
          expires_at,
        });
      }
      Err(e) => {
        warn!("Credential lock poisoned, dropping update: {}", e);
        return;
      }
    }

    let vault = Arc::clone(&self.vault);
    tokio::task::spawn_blocking(move || {
      if let Err(e) = vault.persist(&access_token, refresh_token.as_deref()) {
        warn!("Failed to persist credentials: {}", e);
      }
    });
  }

  pub fn get(&self) -> Option<Credential> {
    self.current.lock().ok().and_then(|c| c.as_ref().cloned())
  }

  pub fn access_token(&self) -> Option<String> {
    // A restored pair may carry only a live refresh token; an empty access
    // token is never attached to a request.
    self.get().map(|c| c.access_token).filter(|t| !t.is_empty())
  }

  pub fn refresh_token(&self) -> Option<String> {
    self.get().and_then(|c| c.refresh_token)
  }

  /// Wipe the in-memory pair and issue a best-effort vault deletion.
  pub fn clear(&self) {
    match self.current.lock() {
      Ok(mut current) => *current = None,
      Err(e) => warn!("Credential lock poisoned during clear: {}", e),
    }

    let vault = Arc::clone(&self.vault);
    tokio::task::spawn_blocking(move || {
      if let Err(e) = vault.clear() {
        warn!("Failed to clear persisted credentials: {}", e);
      }
    });
  }

  /// Install a pair recovered from the vault, without mirroring it back.
  fn restore(&self, persisted: PersistedCredential) {
    if let Ok(mut current) = self.current.lock() {
      *current = Some(Credential {
        expires_at: persisted.access_token.as_deref().and_then(decode_expiry),
        access_token: persisted.access_token.unwrap_or_default(),
        refresh_token: persisted.refresh_token,
      });
    }
  }

  /// Single load attempt from the vault, made once at process start before
  /// any UI renders. Returns whether a credential was restored.
  pub async fn restore_from_vault(&self) -> bool {
    let vault = Arc::clone(&self.vault);
    match tokio::task::spawn_blocking(move || vault.load()).await {
      Ok(Ok(Some(persisted))) => {
        self.restore(persisted);
        true
      }
      Ok(Ok(None)) => false,
      Ok(Err(e)) => {
        warn!("Failed to load persisted credentials: {}", e);
        false
      }
      Err(e) => {
        warn!("Vault load task failed: {}", e);
        false
      }
    }
  }

  /// Whether the access credential is absent, undecodable, or expires
  /// within `threshold`. Fails toward refreshing: an unreadable expiry
  /// reports true.
  pub fn is_expiring_soon(&self, threshold: Duration) -> bool {
    let credential = match self.get() {
      Some(c) => c,
      None => return true,
    };
    let expires_at = match credential.expires_at {
      Some(t) => t,
      None => return true,
    };
    let threshold =
      chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
    expires_at - Utc::now() <= threshold
  }
}

/// Decode the `exp` claim from a JWT access token without verifying it.
/// The server remains the authority; this only schedules proactive refresh.
fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
  let payload = token.split('.').nth(1)?;
  let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
  let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
  let exp = claims.get("exp")?.as_i64()?;
  Utc.timestamp_opt(exp, 0).single()
}

/// Short digest for log lines. Raw tokens never reach the log.
fn fingerprint(token: &str) -> String {
  let digest = Sha256::digest(token.as_bytes());
  hex::encode(&digest[..4])
}

/// Build an unsigned JWT carrying the given `exp` claim, for tests.
#[cfg(test)]
pub(crate) fn jwt_expiring_at(exp: i64) -> String {
  let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
  let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({ "sub": "u1", "exp": exp }).to_string());
  format!("{}.{}.signature", header, payload)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::vault::MemoryVault;

  fn store() -> CredentialStore {
    CredentialStore::new(Arc::new(MemoryVault::new()))
  }

  #[tokio::test]
  async fn token_expiring_within_threshold_reports_soon() {
    let store = store();
    let exp = (Utc::now() + chrono::Duration::minutes(2)).timestamp();
    store.set(jwt_expiring_at(exp), None);

    assert!(store.is_expiring_soon(Duration::from_secs(5 * 60)));
  }

  #[tokio::test]
  async fn token_with_distant_expiry_is_not_soon() {
    let store = store();
    let exp = (Utc::now() + chrono::Duration::hours(10)).timestamp();
    store.set(jwt_expiring_at(exp), None);

    assert!(!store.is_expiring_soon(Duration::from_secs(5 * 60)));
  }

  #[tokio::test]
  async fn undecodable_or_absent_credentials_fail_safe() {
    let store = store();
    assert!(store.is_expiring_soon(Duration::from_secs(60)));

    store.set("not-a-jwt", None);
    assert!(store.is_expiring_soon(Duration::from_secs(60)));
  }

  #[tokio::test]
  async fn set_mirrors_to_the_vault() {
    let vault = Arc::new(MemoryVault::new());
    let store = CredentialStore::new(vault.clone());
    store.set("access-1", Some("refresh-1".to_string()));

    // The mirror write is fire-and-forget; give the blocking task a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let persisted = vault.load().unwrap().unwrap();
    assert_eq!(persisted.access_token.as_deref(), Some("access-1"));
    assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-1"));
  }

  #[tokio::test]
  async fn clear_wipes_memory_and_vault() {
    let vault = Arc::new(MemoryVault::new());
    let store = CredentialStore::new(vault.clone());
    store.set("access-1", Some("refresh-1".to_string()));
    store.clear();

    assert!(store.get().is_none());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(vault.load().unwrap().is_none());
  }

  #[tokio::test]
  async fn restore_loads_a_persisted_pair() {
    let vault = Arc::new(MemoryVault::new());
    vault
      .persist("persisted-access", Some("persisted-refresh"))
      .unwrap();
    let store = CredentialStore::new(vault);

    assert!(store.restore_from_vault().await);
    let current = store.get().unwrap();
    assert_eq!(current.access_token, "persisted-access");
    assert_eq!(current.refresh_token.as_deref(), Some("persisted-refresh"));
  }

  #[tokio::test]
  async fn restore_with_empty_vault_leaves_the_store_empty() {
    let store = CredentialStore::new(Arc::new(MemoryVault::new()));
    assert!(!store.restore_from_vault().await);
    assert!(store.get().is_none());
  }

  #[tokio::test]
  async fn replacing_the_pair_drops_the_old_tokens() {
    let store = store();
    store.set("old-access", Some("old-refresh".to_string()));
    store.set("new-access", None);

    let current = store.get().unwrap();
    assert_eq!(current.access_token, "new-access");
    assert!(current.refresh_token.is_none());
  }
}
